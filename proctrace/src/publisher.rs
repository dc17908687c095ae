use crate::event_bus::ProcessEvent;
use tokio::sync::broadcast;

pub trait Publisher {
    fn publish(
        &self,
        event: ProcessEvent,
    ) -> Result<usize, broadcast::error::SendError<ProcessEvent>>;
}

#[derive(Clone)]
pub struct TxPublisher {
    tx: broadcast::Sender<ProcessEvent>,
}

impl TxPublisher {
    pub fn new(tx: broadcast::Sender<ProcessEvent>) -> Self {
        Self { tx }
    }
}

impl Publisher for TxPublisher {
    fn publish(
        &self,
        event: ProcessEvent,
    ) -> Result<usize, broadcast::error::SendError<ProcessEvent>> {
        self.tx.send(event)
    }
}
