//! Signals from the pollers to the dispatch loop
//!
//! Fatal errors and terminal signals travel on their own channels and are
//! always drained first.
//! An edit carries a oneshot acknowledgement the Control Listener waits on,
//! so it cannot observe a second edit before the first has been handled.

use tokio::sync::{mpsc, oneshot};

use crate::trading::errors::DealError;

/// Signals that end the deal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSignal {
    /// Operator cancelled the deal
    Cancelled,
    /// Operator asked to close at the market price
    ClosedAtMarket,
    /// The take-profit order filled
    TakeProfitFilled,
    /// Every safety order was placed and the last one filled
    LadderExhausted,
}

/// Edit request; dropping or answering `ack` releases the listener
#[derive(Debug)]
pub struct EditRequest {
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug)]
pub enum Signal {
    /// A poller hit an error it cannot retry away
    Fatal(DealError),
    Terminal(TerminalSignal),
    BuyMore,
    Edit(EditRequest),
}

/// Sending half, cloned into each poller
#[derive(Debug, Clone)]
pub struct SignalSender {
    fatal: mpsc::Sender<DealError>,
    terminal: mpsc::Sender<TerminalSignal>,
    buy_more: mpsc::Sender<()>,
    edit: mpsc::Sender<EditRequest>,
}

/// Receiving half, owned by the dispatch loop
#[derive(Debug)]
pub struct SignalReceiver {
    fatal: mpsc::Receiver<DealError>,
    terminal: mpsc::Receiver<TerminalSignal>,
    buy_more: mpsc::Receiver<()>,
    edit: mpsc::Receiver<EditRequest>,
    fatal_open: bool,
    terminal_open: bool,
    buy_more_open: bool,
    edit_open: bool,
}

pub fn channel() -> (SignalSender, SignalReceiver) {
    let (fatal_tx, fatal_rx) = mpsc::channel(2);
    let (terminal_tx, terminal_rx) = mpsc::channel(8);
    let (buy_more_tx, buy_more_rx) = mpsc::channel(1);
    let (edit_tx, edit_rx) = mpsc::channel(1);
    (
        SignalSender {
            fatal: fatal_tx,
            terminal: terminal_tx,
            buy_more: buy_more_tx,
            edit: edit_tx,
        },
        SignalReceiver {
            fatal: fatal_rx,
            terminal: terminal_rx,
            buy_more: buy_more_rx,
            edit: edit_rx,
            fatal_open: true,
            terminal_open: true,
            buy_more_open: true,
            edit_open: true,
        },
    )
}

impl SignalSender {
    /// Hand an unrecoverable error to the dispatch loop
    pub async fn fatal(&self, error: DealError) -> bool {
        self.fatal.send(error).await.is_ok()
    }

    /// Returns false once the dispatch loop is gone
    pub async fn terminal(&self, signal: TerminalSignal) -> bool {
        self.terminal.send(signal).await.is_ok()
    }

    /// Coalesces with a buy-more signal that is still pending
    pub fn buy_more(&self) -> bool {
        match self.buy_more.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Send an edit and wait until the handler acknowledges it.
    /// Returns false if the dispatch loop went away instead.
    pub async fn edit(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.edit.send(EditRequest { ack }).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }
}

impl SignalReceiver {
    /// Next signal, terminal ones first; `None` once every sender is gone
    pub async fn next(&mut self) -> Option<Signal> {
        loop {
            tokio::select! {
                biased;
                error = self.fatal.recv(), if self.fatal_open => match error {
                    Some(error) => return Some(Signal::Fatal(error)),
                    None => self.fatal_open = false,
                },
                signal = self.terminal.recv(), if self.terminal_open => match signal {
                    Some(signal) => return Some(Signal::Terminal(signal)),
                    None => self.terminal_open = false,
                },
                signal = self.buy_more.recv(), if self.buy_more_open => match signal {
                    Some(()) => return Some(Signal::BuyMore),
                    None => self.buy_more_open = false,
                },
                request = self.edit.recv(), if self.edit_open => match request {
                    Some(request) => return Some(Signal::Edit(request)),
                    None => self.edit_open = false,
                },
                else => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminal_wins_over_pending_edit() {
        let (tx, mut rx) = channel();

        let editor = tx.clone();
        let edit_task = tokio::spawn(async move { editor.edit().await });
        // Let the edit land in its channel first
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.buy_more();
        assert!(tx.terminal(TerminalSignal::Cancelled).await);

        match rx.next().await {
            Some(Signal::Terminal(TerminalSignal::Cancelled)) => {}
            other => panic!("expected cancel first, got {other:?}"),
        }

        drop(rx);
        assert!(!edit_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_buy_more_coalesces() {
        let (tx, mut rx) = channel();
        assert!(tx.buy_more());
        assert!(tx.buy_more());
        assert!(tx.buy_more());

        assert!(matches!(rx.next().await, Some(Signal::BuyMore)));
        drop(tx);
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_edit_waits_for_ack() {
        let (tx, mut rx) = channel();
        let edit_task = tokio::spawn(async move { tx.edit().await });

        let request = match rx.next().await {
            Some(Signal::Edit(request)) => request,
            other => panic!("expected edit, got {other:?}"),
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!edit_task.is_finished());

        request.ack.send(()).unwrap();
        assert!(edit_task.await.unwrap());
    }
}
