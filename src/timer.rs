//! Resettable single-shot timers.
//!
//! A [`OneShotTimer`] runs its callback at most once per arming. Arming it
//! again with [`OneShotTimer::reset`] cancels the pending fire, so a timer can
//! never fire twice for one deadline. The callback runs on its own task and
//! goes through the same locks as every other caller.

use std::{
   future::Future,
   sync::{Arc, Weak},
   time::Duration,
};

use futures::future::BoxFuture;
use log::debug;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

type Callback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct TimerState {
   generation: u64,
   pending: Option<JoinHandle<()>>,
}

pub struct OneShotTimer {
   name: &'static str,
   callback: Callback,
   state: Mutex<TimerState>,
}

impl OneShotTimer {
   /// Creates a stopped timer.
   pub fn new<F, Fut>(name: &'static str, callback: F) -> Arc<Self>
   where
      F: Fn() -> Fut + Send + Sync + 'static,
      Fut: Future<Output = ()> + Send + 'static,
   {
      Arc::new(Self {
         name,
         callback: Box::new(move || Box::pin(callback())),
         state: Mutex::new(TimerState::default()),
      })
   }

   /// Arms the timer to fire after `after`, replacing any pending deadline.
   ///
   /// Must be called from within a tokio runtime.
   pub fn reset(self: &Arc<Self>, after: Duration) {
      let mut state = self.state.lock();
      state.generation += 1;
      let generation = state.generation;
      if let Some(handle) = state.pending.take() {
         handle.abort();
      }

      let timer: Weak<Self> = Arc::downgrade(self);
      state.pending = Some(tokio::spawn(async move {
         time::sleep(after).await;
         let Some(timer) = timer.upgrade() else {
            return;
         };
         let fire = {
            let mut state = timer.state.lock();
            if state.generation != generation {
               return;
            }
            // Detach ourselves so a reset from inside the callback cannot abort it.
            state.pending = None;
            (timer.callback)()
         };
         debug!("timer {} fired", timer.name);
         fire.await;
      }));
   }

   /// Cancels a pending fire. Returns whether one was pending.
   pub fn stop(&self) -> bool {
      let mut state = self.state.lock();
      state.generation += 1;
      match state.pending.take() {
         Some(handle) => {
            handle.abort();
            true
         },
         None => false,
      }
   }

   pub fn is_armed(&self) -> bool {
      self.state.lock().pending.is_some()
   }
}

impl Drop for OneShotTimer {
   fn drop(&mut self) {
      if let Some(handle) = self.state.get_mut().pending.take() {
         handle.abort();
      }
   }
}
