//! Component lifecycle reporting.
//!
//! Each tracker component registers once and reports one of four states. The state an
//! external supervisor sees for a component folds in the states of everything it depends
//! on, so a failed state store shows up on every component that needs it:
//!   - any `Error` along the dependency edges makes the component `Error`
//!   - otherwise any `Down`, then any `Starting`, wins over `Up`
//!
//! `Error` is terminal for the reporting component; only [`HealthRegistry::reset`]
//! (operator intervention) leaves it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Up,
    Down,
    Error,
}

impl LifecycleState {
    fn severity(self) -> u8 {
        match self {
            LifecycleState::Up => 0,
            LifecycleState::Starting => 1,
            LifecycleState::Down => 2,
            LifecycleState::Error => 3,
        }
    }

    fn worst(self, other: LifecycleState) -> LifecycleState {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug)]
struct ComponentEntry {
    state: LifecycleState,
    depends_on: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HealthStatus {
    /// true when every registered component is effectively `Up`
    pub healthy: bool,
    pub components: HashMap<String, LifecycleState>,
}

#[derive(Debug)]
pub struct HealthRegistry {
    components: DashMap<String, ComponentEntry>,
    generation: watch::Sender<u64>,
}

impl HealthRegistry {
    pub fn new() -> Arc<Self> {
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            components: DashMap::new(),
            generation,
        })
    }

    /// Registers `component` in the `Starting` state with explicit dependency edges.
    /// Registering an existing name replaces its edges and restarts it.
    pub fn register(self: &Arc<Self>, component: &str, depends_on: &[&str]) -> HealthHandle {
        self.components.insert(
            component.to_string(),
            ComponentEntry {
                state: LifecycleState::Starting,
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        );
        self.bump();
        HealthHandle {
            component: component.to_string(),
            registry: Arc::clone(self),
        }
    }

    /// Own state of a component, ignoring dependencies.
    pub fn own_state(&self, component: &str) -> Option<LifecycleState> {
        self.components.get(component).map(|entry| entry.state)
    }

    /// State of a component combined with all of its transitive dependencies.
    /// A dependency that was never registered counts as `Starting`.
    pub fn effective_state(&self, component: &str) -> LifecycleState {
        let mut visited = HashSet::new();
        self.fold_state(component, &mut visited)
    }

    fn fold_state(&self, component: &str, visited: &mut HashSet<String>) -> LifecycleState {
        if !visited.insert(component.to_string()) {
            return LifecycleState::Up;
        }
        let (own, deps) = match self.components.get(component) {
            Some(entry) => (entry.state, entry.depends_on.clone()),
            None => return LifecycleState::Starting,
        };
        deps.iter().fold(own, |state, dep| {
            state.worst(self.fold_state(dep, visited))
        })
    }

    pub fn status(&self) -> HealthStatus {
        let names: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        let components: HashMap<String, LifecycleState> = names
            .into_iter()
            .map(|name| {
                let state = self.effective_state(&name);
                (name, state)
            })
            .collect();
        let healthy = components.values().all(|s| *s == LifecycleState::Up);
        HealthStatus {
            healthy,
            components,
        }
    }

    /// Receiver that changes whenever any component reports a different state.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Operator intervention: puts a component back to `Starting`, including out of `Error`.
    pub fn reset(&self, component: &str) {
        if let Some(mut entry) = self.components.get_mut(component) {
            warn!("health of {} reset from {:?}", component, entry.state);
            entry.state = LifecycleState::Starting;
        }
        self.bump();
    }

    fn set(&self, component: &str, state: LifecycleState) {
        let changed = match self.components.get_mut(component) {
            Some(mut entry) => {
                if entry.state == state {
                    false
                } else if entry.state == LifecycleState::Error {
                    warn!(
                        "{} is in terminal error state, ignoring report {:?}",
                        component, state
                    );
                    false
                } else {
                    entry.state = state;
                    true
                }
            }
            None => false,
        };
        if changed {
            match state {
                LifecycleState::Error => error!("component {} reported Error", component),
                _ => info!("component {} is now {:?}", component, state),
            }
            self.bump();
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

/// Reporting side handed to one component.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    component: String,
    registry: Arc<HealthRegistry>,
}

impl HealthHandle {
    pub fn report(&self, state: LifecycleState) {
        self.registry.set(&self.component, state);
    }

    pub fn report_up(&self) {
        self.report(LifecycleState::Up);
    }

    pub fn report_error(&self) {
        self.report(LifecycleState::Error);
    }

    pub fn state(&self) -> LifecycleState {
        self.registry
            .own_state(&self.component)
            .unwrap_or(LifecycleState::Starting)
    }

    pub fn is_failed(&self) -> bool {
        self.state() == LifecycleState::Error
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}
