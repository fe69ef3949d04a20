// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use tracing::warn;

/// Work queued from the impl context, to be run on the main context.
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// A channel sender that wakes the coordinator's poll after every message,
/// so that queued callbacks get flushed.
pub(crate) struct WakingSender<T> {
    waker: Arc<mio::Waker>,
    sender: crossbeam_channel::Sender<T>,
}

impl<T> Clone for WakingSender<T> {
    fn clone(&self) -> Self {
        Self {
            waker: self.waker.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<T> WakingSender<T> {
    pub fn new(waker: Arc<mio::Waker>, sender: crossbeam_channel::Sender<T>) -> Self {
        Self { waker, sender }
    }

    pub fn send(&self, msg: T) -> Result<(), crossbeam_channel::SendError<T>> {
        self.sender.send(msg)?;
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake the main context");
        }

        Ok(())
    }

    /// Wakes the receiving side without sending anything.
    pub fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake the main context");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn send_wakes_poll() {
        let mut poll = mio::Poll::new().unwrap();
        let waker = Arc::new(mio::Waker::new(poll.registry(), mio::Token(7)).unwrap());
        let (send, recv) = crossbeam_channel::unbounded();
        let sender = WakingSender::new(waker, send);

        sender.send(42).unwrap();

        let mut events = mio::Events::with_capacity(4);
        poll.poll(&mut events, Some(std::time::Duration::from_secs(1)))
            .unwrap();

        let tokens: Vec<_> = events.iter().map(|ev| ev.token()).collect();
        assert_eq!(tokens, vec![mio::Token(7)]);
        assert_eq!(recv.try_recv(), Ok(42));
    }
}
