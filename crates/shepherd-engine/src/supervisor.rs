//! Fleet controller.
//!
//! The [`Supervisor`] owns the command set, re-evaluates on every tick
//! which commands are eligible to (re)start, gates dependents on their
//! dependencies' children being up, and aggregates teardown into a single
//! completion. Scheduling is level-triggered: a dependency satisfied
//! between ticks is honored on the next pass.

use std::collections::HashMap;
use std::sync::Arc;

use shepherd_core::{CommandSpec, ProcessState};
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, error, info};

use crate::command::{Command, CommandError};
use crate::config::EngineConfig;
use crate::events::{EventHub, SupervisionEvent};
use crate::graph::{self, GraphError};

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("A command with identifier '{id}' is already registered")]
    DuplicateIdentifier { id: String },

    #[error("No command with identifier '{id}'")]
    NotFound { id: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Supervises a fixed set of named commands.
pub struct Supervisor {
    config: Arc<EngineConfig>,
    hub: EventHub,
    /// Registered commands, in insertion order for deterministic scans.
    commands: RwLock<Vec<Arc<Command>>>,
}

impl Supervisor {
    /// Create a supervisor with the given engine configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            hub: EventHub::new(),
            commands: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to supervision events for every managed command.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisionEvent> {
        self.hub.subscribe()
    }

    /// The engine configuration this supervisor runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a command.
    ///
    /// Rejects duplicate identifiers, empty command lines, and dependency
    /// cycles among the registered commands; all three are configuration
    /// errors, surfaced immediately and never retried.
    pub async fn add_command(&self, spec: CommandSpec) -> Result<Arc<Command>, SupervisorError> {
        let mut commands = self.commands.write().await;
        if commands.iter().any(|c| c.id() == spec.identifier) {
            return Err(SupervisorError::DuplicateIdentifier {
                id: spec.identifier,
            });
        }

        let mut deps: HashMap<String, Vec<String>> = commands
            .iter()
            .map(|c| (c.id().to_string(), c.spec().depends.clone()))
            .collect();
        deps.insert(spec.identifier.clone(), spec.depends.clone());
        graph::validate_acyclic(&deps)?;

        let command = Command::new(spec, Arc::clone(&self.config), self.hub.clone())?;
        commands.push(Arc::clone(&command));
        Ok(command)
    }

    /// Look a command up by identifier.
    pub async fn get_command(&self, id: &str) -> Option<Arc<Command>> {
        self.commands
            .read()
            .await
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// All registered commands, in registration order.
    pub async fn get_all_commands(&self) -> Vec<Arc<Command>> {
        self.commands.read().await.clone()
    }

    /// Remove a command from the set and schedule graceful teardown of its
    /// agent. Does not block on the teardown.
    pub async fn remove_command(&self, id: &str) -> Result<(), SupervisorError> {
        let mut commands = self.commands.write().await;
        let position = commands
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| SupervisorError::NotFound { id: id.to_string() })?;
        let command = commands.remove(position);
        drop(commands);

        info!(id, "Removing command");
        tokio::spawn(async move {
            let done = command.quit_agent().await;
            let _ = done.await;
        });
        Ok(())
    }

    /// One scheduling pass over the command set.
    ///
    /// Starts every eligible command whose dependencies all have running
    /// children, applying each started command's post-start delay before
    /// evaluating the rest of the set, so chains of dependents launch in a
    /// deterministic order.
    pub async fn tick(&self) {
        let snapshot = self.commands.read().await.clone();
        for command in &snapshot {
            if !command.is_eligible().await {
                continue;
            }
            if !self.dependencies_running(command.spec(), &snapshot).await {
                debug!(id = %command.id(), "Dependencies not running yet");
                continue;
            }
            match command.start().await {
                Ok(()) => tokio::time::sleep(command.spec().sleep_after).await,
                Err(e) => error!(id = %command.id(), error = %e, "Failed to start command"),
            }
        }
    }

    async fn dependencies_running(&self, spec: &CommandSpec, snapshot: &[Arc<Command>]) -> bool {
        for dep in &spec.depends {
            let Some(dependency) = snapshot.iter().find(|c| c.id() == *dep) else {
                // Not registered yet; gate until it appears.
                return false;
            };
            if dependency.child_state().await != ProcessState::Running {
                return false;
            }
        }
        true
    }

    /// Drive the scheduling tick until the shutdown flag flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.tick_interval, "Supervisor loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Supervisor loop stopped");
    }

    /// Gracefully tear down every command's agent.
    ///
    /// All teardowns are initiated concurrently; the returned future
    /// resolves only once every agent has been reaped.
    pub async fn cleanup(&self) {
        let snapshot = self.commands.read().await.clone();
        info!(count = snapshot.len(), "Tearing down all agents");
        let mut completions = Vec::with_capacity(snapshot.len());
        for command in &snapshot {
            completions.push(command.quit_agent().await);
        }
        for done in completions {
            let _ = done.await;
        }
        info!("All agents stopped");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn registration_preserves_order() {
        let sup = supervisor();
        for id in ["one", "two", "three"] {
            sup.add_command(CommandSpec::new("sleep 60", id)).await.unwrap();
        }
        let ids: Vec<_> = sup
            .get_all_commands()
            .await
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(ids, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn duplicate_identifier_is_rejected() {
        let sup = supervisor();
        sup.add_command(CommandSpec::new("sleep 60", "dup")).await.unwrap();
        assert!(matches!(
            sup.add_command(CommandSpec::new("sleep 30", "dup")).await,
            Err(SupervisorError::DuplicateIdentifier { .. })
        ));
    }

    #[tokio::test]
    async fn empty_command_line_is_rejected() {
        let sup = supervisor();
        assert!(matches!(
            sup.add_command(CommandSpec::new("", "hollow")).await,
            Err(SupervisorError::Command(_))
        ));
        assert!(sup.get_all_commands().await.is_empty());
    }

    #[tokio::test]
    async fn dependency_cycle_is_rejected_at_registration() {
        let sup = supervisor();
        sup.add_command(
            CommandSpec::new("sleep 60", "a").with_depends(vec!["b".into()]),
        )
        .await
        .unwrap();
        let result = sup
            .add_command(CommandSpec::new("sleep 60", "b").with_depends(vec!["a".into()]))
            .await;
        assert!(matches!(result, Err(SupervisorError::Graph(_))));
        assert_eq!(sup.get_all_commands().await.len(), 1);
    }

    #[tokio::test]
    async fn dependents_may_be_registered_first() {
        let sup = supervisor();
        sup.add_command(
            CommandSpec::new("sleep 60", "b").with_depends(vec!["a".into()]),
        )
        .await
        .unwrap();
        sup.add_command(CommandSpec::new("sleep 60", "a")).await.unwrap();
        assert_eq!(sup.get_all_commands().await.len(), 2);
    }

    #[tokio::test]
    async fn remove_unknown_command_fails() {
        let sup = supervisor();
        assert!(matches!(
            sup.remove_command("ghost").await,
            Err(SupervisorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn remove_takes_command_out_of_the_set() {
        let sup = supervisor();
        sup.add_command(CommandSpec::new("sleep 60", "gone")).await.unwrap();
        sup.remove_command("gone").await.unwrap();
        assert!(sup.get_all_commands().await.is_empty());
        assert!(sup.get_command("gone").await.is_none());
    }

    #[tokio::test]
    async fn cleanup_with_stopped_agents_resolves() {
        let sup = supervisor();
        for id in ["x", "y"] {
            sup.add_command(CommandSpec::new("sleep 60", id)).await.unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), sup.cleanup())
            .await
            .expect("cleanup of idle commands should resolve promptly");
    }
}
