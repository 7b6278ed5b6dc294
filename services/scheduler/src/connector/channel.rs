//! Connector backed by plain channels.
//!
//! The embedding program (or a test) holds the [`ConnectorDriver`] and plays
//! the resource manager: it pushes events in and reads the commands the
//! scheduler sends out.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::{Command, Connector, ConnectorError, ConnectorEvent, FrameworkInfo};

pub struct ChannelConnector {
    events: mpsc::Receiver<ConnectorEvent>,
    commands: mpsc::Sender<Command>,
    framework: Option<oneshot::Sender<FrameworkInfo>>,
}

/// The far end of a [`ChannelConnector`].
pub struct ConnectorDriver {
    pub events: mpsc::Sender<ConnectorEvent>,
    pub commands: mpsc::Receiver<Command>,
    /// Resolves with the registration descriptor once the scheduler starts
    /// the connector.
    pub framework: oneshot::Receiver<FrameworkInfo>,
}

impl ChannelConnector {
    pub fn new(capacity: usize) -> (Self, ConnectorDriver) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(capacity.max(1));
        let (framework_tx, framework_rx) = oneshot::channel();
        (
            Self {
                events: events_rx,
                commands: commands_tx,
                framework: Some(framework_tx),
            },
            ConnectorDriver {
                events: events_tx,
                commands: commands_rx,
                framework: framework_rx,
            },
        )
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn run(
        mut self: Box<Self>,
        framework: FrameworkInfo,
        events: mpsc::Sender<ConnectorEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        if let Some(tx) = self.framework.take() {
            let _ = tx.send(framework);
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(ConnectorError::Disconnected("driver dropped".to_string()));
                    };
                    debug!(event = event.kind(), "Forwarding connector event");
                    events
                        .send(event)
                        .await
                        .map_err(|_| ConnectorError::ChannelClosed)?;
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    // A driver that stopped reading commands is not an error.
                    let _ = self.commands.send(command).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_id::FrameworkId;

    #[tokio::test]
    async fn test_forwards_both_ways() {
        let (connector, mut driver) = ChannelConnector::new(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Box::new(connector).run(
            FrameworkInfo::default(),
            events_tx,
            commands_rx,
            shutdown_rx,
        ));

        assert_eq!((&mut driver.framework).await.unwrap().name, "berth");

        let framework_id = FrameworkId::parse("fw-1").unwrap();
        driver
            .events
            .send(ConnectorEvent::Subscribed {
                framework_id: framework_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(ConnectorEvent::Subscribed { framework_id })
        );

        commands_tx
            .send(Command::Reconcile { tasks: vec![] })
            .await
            .unwrap();
        assert_eq!(
            driver.commands.recv().await,
            Some(Command::Reconcile { tasks: vec![] })
        );

        drop(driver);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ConnectorError::Disconnected(_))
        ));
    }
}
