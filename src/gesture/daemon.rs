//! The system gesture recogniser.
//!
//! Raw touchpad and touchscreen input is turned into named gestures by a
//! system service; this daemon only receives its signals and pushes the press
//! timings to it.

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use zbus::{Connection, proxy};

use crate::error::Result;

#[proxy(
   interface = "org.desktopd.GestureDaemon",
   default_service = "org.desktopd.GestureDaemon",
   default_path = "/org/desktopd/GestureDaemon"
)]
trait Recognizer {
   fn set_long_press_duration(&self, duration: u32) -> zbus::Result<()>;
   fn set_short_press_duration(&self, duration: u32) -> zbus::Result<()>;
   fn set_edge_move_stop_duration(&self, duration: u32) -> zbus::Result<()>;

   #[zbus(signal)]
   fn event(&self, name: String, direction: String, fingers: i32) -> zbus::Result<()>;

   #[zbus(signal)]
   fn touch_edge_move_stop_leave(
      &self,
      direction: String,
      scale_x: f64,
      scale_y: f64,
      duration: i32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   fn touch_edge_event(&self, direction: String, scale_x: f64, scale_y: f64) -> zbus::Result<()>;
}

/// A recognised gesture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GestureEvent {
   pub name: String,
   pub direction: String,
   pub fingers: i32,
}

/// A touchscreen swipe that started at a screen edge. `scale_x` and
/// `scale_y` locate the touch point as fractions of the screen size.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSwipe {
   pub edge: String,
   pub scale_x: f64,
   pub scale_y: f64,
}

/// Everything the recogniser reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerSignal {
   Gesture(GestureEvent),
   /// The finger rested after leaving an edge, then lifted.
   EdgeMoveStopLeave { swipe: EdgeSwipe, duration: i32 },
   Edge(EdgeSwipe),
}

#[async_trait]
pub trait GestureDaemon: Send + Sync {
   async fn set_long_press_duration(&self, duration: u32) -> Result<()>;
   async fn set_short_press_duration(&self, duration: u32) -> Result<()>;
   async fn set_edge_move_stop_duration(&self, duration: u32) -> Result<()>;
   async fn events(&self) -> Result<BoxStream<'static, RecognizerSignal>>;
}

pub struct ZbusGestureDaemon {
   proxy: RecognizerProxy<'static>,
}

impl ZbusGestureDaemon {
   pub async fn new(system: &Connection) -> Result<Self> {
      Ok(Self {
         proxy: RecognizerProxy::new(system).await?,
      })
   }
}

#[async_trait]
impl GestureDaemon for ZbusGestureDaemon {
   async fn set_long_press_duration(&self, duration: u32) -> Result<()> {
      Ok(self.proxy.set_long_press_duration(duration).await?)
   }

   async fn set_short_press_duration(&self, duration: u32) -> Result<()> {
      Ok(self.proxy.set_short_press_duration(duration).await?)
   }

   async fn set_edge_move_stop_duration(&self, duration: u32) -> Result<()> {
      Ok(self.proxy.set_edge_move_stop_duration(duration).await?)
   }

   async fn events(&self) -> Result<BoxStream<'static, RecognizerSignal>> {
      let gestures = self
         .proxy
         .receive_event()
         .await?
         .filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(RecognizerSignal::Gesture(GestureEvent {
               name: args.name().clone(),
               direction: args.direction().clone(),
               fingers: *args.fingers(),
            }))
         });
      let stops = self
         .proxy
         .receive_touch_edge_move_stop_leave()
         .await?
         .filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(RecognizerSignal::EdgeMoveStopLeave {
               swipe: EdgeSwipe {
                  edge: args.direction().clone(),
                  scale_x: *args.scale_x(),
                  scale_y: *args.scale_y(),
               },
               duration: *args.duration(),
            })
         });
      let edges = self
         .proxy
         .receive_touch_edge_event()
         .await?
         .filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(RecognizerSignal::Edge(EdgeSwipe {
               edge: args.direction().clone(),
               scale_x: *args.scale_x(),
               scale_y: *args.scale_y(),
            }))
         });
      Ok(futures::stream::select_all([gestures.boxed(), stops.boxed(), edges.boxed()]).boxed())
   }
}
