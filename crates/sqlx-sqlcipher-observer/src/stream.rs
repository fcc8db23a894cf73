use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::registry::{ChangeNotice, ObserverId};

/// Item yielded by a [`ChangeStream`].
#[derive(Debug, Clone)]
pub enum ChangeEvent {
   Change(ChangeNotice),
   /// The subscriber fell behind and this many notices were dropped
   Lagged(u64),
}

/// A stream of commit notices, optionally ignoring one origin.
pub struct ChangeStream {
   inner: BroadcastStream<ChangeNotice>,
   skip_origin: Option<ObserverId>,
}

impl ChangeStream {
   pub fn new(rx: broadcast::Receiver<ChangeNotice>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
         skip_origin: None,
      }
   }

   /// Drop notices for changes made by `origin`.
   pub fn skip_origin(mut self, origin: ObserverId) -> Self {
      self.skip_origin = Some(origin);
      self
   }
}

impl Stream for ChangeStream {
   type Item = ChangeEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(notice))) => {
               if notice.origin.is_some() && notice.origin == self.skip_origin {
                  continue;
               }
               return Poll::Ready(Some(ChangeEvent::Change(notice)));
            }
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
               warn!(
                  missed = count,
                  "change stream lagged; raise channel_capacity to keep up"
               );
               return Poll::Ready(Some(ChangeEvent::Lagged(count)));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}

/// Converts a notice receiver into a [`ChangeStream`].
pub trait ChangeStreamExt {
   fn into_stream(self) -> ChangeStream;
}

impl ChangeStreamExt for broadcast::Receiver<ChangeNotice> {
   fn into_stream(self) -> ChangeStream {
      ChangeStream::new(self)
   }
}
