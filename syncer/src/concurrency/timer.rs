//! Fill deadline of a queue worker's pending batch.
//!
//! The deadline is armed when the first job enters an empty batch and disarmed when the batch is
//! flushed, so an idle queue never wakes up. While disarmed the timer stays pending, which lets it
//! sit in a `tokio::select!` branch unconditionally.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::time::{Sleep, sleep};

#[derive(Debug)]
pub struct BatchDeadline {
    deadline: Option<Pin<Box<Sleep>>>,
    /// `None` when time based flushing is disabled.
    fill_duration: Option<Duration>,
}

impl BatchDeadline {
    /// Creates a disarmed deadline. A zero `fill_duration` disables it entirely.
    pub fn new(fill_duration: Duration) -> Self {
        Self {
            deadline: None,
            fill_duration: (!fill_duration.is_zero()).then_some(fill_duration),
        }
    }

    /// Arms the deadline unless it is already running.
    pub fn arm(&mut self) {
        if self.deadline.is_some() {
            return;
        }

        if let Some(duration) = self.fill_duration {
            self.deadline = Some(Box::pin(sleep(duration)));
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

impl Future for BatchDeadline {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(deadline) = this.deadline.as_mut() else {
            return Poll::Pending;
        };

        ready!(deadline.as_mut().poll(cx));
        this.deadline = None;

        Poll::Ready(())
    }
}
