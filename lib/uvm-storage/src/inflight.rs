// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot completion signals for deduplicating in-flight operations.
//!
//! The first caller to register a resource receives a [Completer] and is
//! responsible for performing the work.  Everyone else holds (a clone of) the
//! matching [Completion] and waits on it.  The outcome is latched: callers
//! arriving after resolution observe it immediately.

use tokio::sync::watch;

/// The producer side was dropped without recording an outcome.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Abandoned;

type Slot<E> = Option<Result<(), E>>;

/// Resolves the paired [Completion] exactly once.
#[derive(Debug)]
pub struct Completer<E> {
    tx: watch::Sender<Slot<E>>,
}

/// Waitable outcome of an operation performed by someone else.
#[derive(Debug, Clone)]
pub struct Completion<E> {
    rx: watch::Receiver<Slot<E>>,
}

pub fn pair<E: Clone>() -> (Completer<E>, Completion<E>) {
    let (tx, rx) = watch::channel(None);
    (Completer { tx }, Completion { rx })
}

impl<E: Clone> Completer<E> {
    pub fn complete(self, result: Result<(), E>) {
        // `send_replace` stores the value even when no receiver is listening.
        self.tx.send_replace(Some(result));
    }
}

impl<E: Clone + From<Abandoned>> Completion<E> {
    /// A completion which is already resolved with `result`.
    pub fn resolved(result: Result<(), E>) -> Self {
        let (tx, rx) = watch::channel(Some(result));
        drop(tx);
        Self { rx }
    }

    /// Wait for the operation to finish and return its outcome.
    pub async fn wait(&self) -> Result<(), E> {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(res) = current {
                return res;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or_else(|| Err(E::from(Abandoned)));
            }
        }
    }

    /// The outcome, if one has been recorded.
    pub fn peek(&self) -> Option<Result<(), E>> {
        self.rx.borrow().clone()
    }

    /// True while the producer is alive and has not recorded an outcome.
    pub fn is_pending(&self) -> bool {
        self.rx.borrow().is_none() && self.rx.has_changed().is_ok()
    }
}
