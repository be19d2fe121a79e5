//! This module provides the [`StateMachine`]'s `Event`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::sync::Arc;

use tokio::sync::watch;

use fedlora_core::RoundId;

use crate::state_machine::phases::PhaseName;

/// An event emitted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event<E> {
    /// The round in which the event was emitted.
    pub round: RoundId,
    /// The event itself
    pub event: E,
}

/// A convenience type to emit the phase events of all rounds.
///
/// Cloning is cheap, all clones emit to the same listeners.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    phase_tx: Arc<watch::Sender<Event<PhaseName>>>,
}

/// The `EventSubscriber` hands out `EventListener`s for phase events.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial phase.
    pub fn init(round: RoundId, phase: PhaseName) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(Event {
            round,
            event: phase,
        });
        let publisher = EventPublisher {
            phase_tx: Arc::new(phase_tx),
        };
        let subscriber = EventSubscriber {
            phase_rx: EventListener(phase_rx),
        };
        (publisher, subscriber)
    }

    /// Emit a phase event
    pub fn broadcast_phase(&self, round: RoundId, phase: PhaseName) {
        // We don't care whether there's a listener or not
        let _ = self.phase_tx.send(Event {
            round,
            event: phase,
        });
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }
}

/// A listener for state machine events. It can be used to either retrieve the latest `Event<E>`
/// (with `EventListener::get_latest`) or to wait for the next one (with `EventListener::changed`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the publisher has been dropped.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow_and_update().clone())
    }
}
