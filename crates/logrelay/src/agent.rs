// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The long-running agent: one dispatcher driving rotate and ship passes.
//!
//! ```text
//!   rotate trigger ──┐
//!   ship trigger   ──┼──> dispatcher ──lock──> AgentState { config, inputs, store, shipper }
//!   reload (HUP)   ──┤
//!   shutdown       ──┘  (checked first)
//! ```
//!
//! Every pass holds the state mutex from start to end, so rotation, shipping
//! and reload never interleave.

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{device_id::ensure_device_id, Config, ConfigError, Paths};
use crate::notify::{PostRotateNotifier, RotationHook};
use crate::policy::RotatePolicy;
use crate::registry::{load_inputs, LogInput, RegistryError};
use crate::rotate::{force_rotate, rotate_by_timestamp_cut, rotate_if_needed, RotateError};
use crate::scheduler::{Schedule, Trigger};
use crate::shipper::{ShipError, Shipper};
use crate::store::{CheckpointStore, StoreError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("checkpoint store: {0}")]
    Store(#[from] StoreError),
    #[error("shipper: {0}")]
    Ship(#[from] ShipError),
}

/// Everything a pass needs, behind one lock.
#[derive(Debug)]
pub struct AgentState {
    pub config: Config,
    pub inputs: Vec<LogInput>,
    pub store: Option<CheckpointStore>,
    pub shipper: Shipper,
}

struct Settings {
    config: Config,
    inputs: Vec<LogInput>,
    shipper: Shipper,
}

impl Settings {
    fn load(paths: &Paths) -> Result<Self, AgentError> {
        let mut config = Config::load(&paths.config_file)?;
        // Reject a bad rotate_at before anything starts running on it.
        config.rotate_schedule()?;
        ensure_device_id(&mut config, &paths.device_id_path)?;
        let inputs = load_inputs(&paths.inputs_dir)?;
        let shipper = Shipper::new(&config)?;
        Ok(Self {
            config,
            inputs,
            shipper,
        })
    }
}

struct Triggers {
    rotate: Trigger,
    ship: Trigger,
}

impl Triggers {
    fn start(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            rotate: Trigger::start("rotate", config.rotate_schedule()?),
            ship: Trigger::start("ship", config.ship_schedule()),
        })
    }

    async fn update(self, rotate: Schedule, ship: Schedule) -> Self {
        Self {
            rotate: self.rotate.update(rotate).await,
            ship: self.ship.update(ship).await,
        }
    }

    async fn stop(self) {
        self.rotate.stop().await;
        self.ship.stop().await;
    }
}

/// Owns the agent state and runs passes against it.
pub struct Agent {
    paths: Paths,
    state: Arc<Mutex<AgentState>>,
    hook: Arc<dyn RotationHook>,
}

impl Agent {
    /// Loads configuration, device id and inputs from `paths` and opens the
    /// checkpoint store for writing.
    pub fn load(paths: Paths) -> Result<Self, AgentError> {
        let Settings {
            config,
            inputs,
            shipper,
        } = Settings::load(&paths)?;
        let store = CheckpointStore::open(&paths.state_path)?;
        info!(
            "Loaded {} inputs, checkpoints at {}",
            inputs.len(),
            store.path().display()
        );
        Ok(Self {
            paths,
            state: Arc::new(Mutex::new(AgentState {
                config,
                inputs,
                store: Some(store),
                shipper,
            })),
            hook: Arc::new(PostRotateNotifier),
        })
    }

    /// Replaces the post-rotation hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn RotationHook>) -> Self {
        self.hook = hook;
        self
    }

    #[must_use]
    pub fn state(&self) -> Arc<Mutex<AgentState>> {
        Arc::clone(&self.state)
    }

    /// Rotates every input that is due, or every input when `force` is set.
    /// Returns how many files were rotated.
    pub async fn rotate_pass(&self, force: bool) -> usize {
        let mut state = self.state.lock().await;
        if !state.config.enabled {
            debug!("Agent disabled, skipping rotation");
            return 0;
        }
        self.refresh_inputs(&mut state);

        let mut rotated = 0;
        for input in &state.inputs {
            let policy = RotatePolicy::resolve(&state.config.defaults, &input.policy);
            let result = if force {
                force_rotate(&input.path, &policy)
            } else {
                rotate_if_needed(&input.path, &policy)
            };
            if self.finish_rotation(&state, input, result).await {
                rotated += 1;
            }
        }
        rotated
    }

    /// Daily rotation catch-up. Once today's `rotate_at` slot has passed,
    /// every input not rotated since the slot is rotated: split at the slot
    /// when the input has a timestamp layout, whole otherwise.
    pub async fn rotate_if_due<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> usize {
        let mut state = self.state.lock().await;
        if !state.config.enabled {
            debug!("Agent disabled, skipping scheduled rotation");
            return 0;
        }
        let at = match state.config.daily_rotate_at() {
            Ok(Some(at)) => at,
            Ok(None) => return 0,
            Err(e) => {
                warn!("{e}");
                return 0;
            }
        };
        let slot = at.today(now);
        if slot > *now {
            return 0;
        }
        self.refresh_inputs(&mut state);

        let mut rotated = 0;
        for input in &state.inputs {
            let last_rotate_at = state
                .store
                .as_ref()
                .and_then(|store| store.get(&input.package, &input.log_id, &input.path).ok())
                .flatten()
                .map_or(0, |checkpoint| checkpoint.last_rotate_at);
            if last_rotate_at >= slot.timestamp() {
                continue;
            }

            let policy = RotatePolicy::resolve(&state.config.defaults, &input.policy);
            let result = match input.timestamp_layout() {
                Some(layout) => rotate_by_timestamp_cut(&input.path, &policy, layout, &slot),
                None => force_rotate(&input.path, &policy),
            };
            if self.finish_rotation(&state, input, result).await {
                rotated += 1;
            }
        }
        rotated
    }

    async fn finish_rotation(
        &self,
        state: &AgentState,
        input: &LogInput,
        result: Result<bool, RotateError>,
    ) -> bool {
        match result {
            Ok(true) => {
                if let Some(store) = &state.store {
                    let stamped = store
                        .get_or_default(&input.package, &input.log_id, &input.path)
                        .and_then(|mut checkpoint| {
                            checkpoint.last_rotate_at = Utc::now().timestamp();
                            store.save(&checkpoint)
                        });
                    if let Err(e) = stamped {
                        warn!("Failed to record rotation of {}: {e}", input.path.display());
                    }
                }
                if let Err(e) = self.hook.rotated(input).await {
                    warn!("Post-rotate action for {} failed: {e}", input.path.display());
                }
                true
            }
            Ok(false) => false,
            Err(RotateError::NotFound(path)) => {
                debug!("Skipping missing {}", path.display());
                false
            }
            Err(e) => {
                error!("Rotation of {} failed: {e}", input.path.display());
                false
            }
        }
    }

    /// Ships one chunk of every shipping-enabled input. Returns how many
    /// shipments the collector accepted or found nothing to send.
    pub async fn ship_pass(&self) -> usize {
        let mut state = self.state.lock().await;
        if !state.config.enabled {
            debug!("Agent disabled, skipping shipping");
            return 0;
        }
        if state.config.dry_run {
            info!("Dry run, skipping shipping");
            return 0;
        }
        self.refresh_inputs(&mut state);

        let mut shipped = 0;
        for input in state.inputs.iter().filter(|input| input.ship_enabled()) {
            match state.shipper.ship_once(input, state.store.as_ref()).await {
                Ok(_) => shipped += 1,
                Err(ShipError::NotFound(path)) => debug!("Skipping missing {}", path.display()),
                Err(e) => error!(
                    "Shipping {}/{} failed: {e}",
                    input.package, input.log_id
                ),
            }
        }
        shipped
    }

    /// Picks up added or removed descriptor files. A broken registry keeps
    /// the inputs already loaded.
    fn refresh_inputs(&self, state: &mut AgentState) {
        match load_inputs(&self.paths.inputs_dir) {
            Ok(inputs) => state.inputs = inputs,
            Err(e) => warn!("Keeping previous inputs: {e}"),
        }
    }

    /// Re-reads configuration and inputs. On failure the previous settings
    /// stay in effect.
    pub async fn reload(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        self.reload_locked(&mut state)
    }

    fn reload_locked(&self, state: &mut MutexGuard<'_, AgentState>) -> Result<(), AgentError> {
        let settings = Settings::load(&self.paths)?;
        state.config = settings.config;
        state.inputs = settings.inputs;
        state.shipper = settings.shipper;
        info!("Configuration reloaded, {} inputs", state.inputs.len());
        Ok(())
    }

    /// Runs until `shutdown` is cancelled. Every message on `reload` triggers
    /// a reload. Returns at once when the agent is disabled.
    pub async fn run(
        &self,
        mut reload: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let (mut triggers, rotate_on_start) = {
            let state = self.state.lock().await;
            if !state.config.enabled {
                info!("Agent disabled in configuration, exiting");
                return Ok(());
            }
            (
                Triggers::start(&state.config)?,
                state.config.defaults.rotate_on_start,
            )
        };
        info!(
            "Agent started, rotation {}, shipping {}",
            triggers.rotate.schedule(),
            triggers.ship.schedule()
        );

        if rotate_on_start {
            self.rotate_pass(true).await;
        }
        self.rotate_if_due(&Local::now()).await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(()) = reload.recv() => {
                    let mut state = self.state.lock().await;
                    match self.reload_locked(&mut state) {
                        Ok(()) => {
                            // Validated while loading.
                            let rotate = state.config.rotate_schedule()?;
                            let ship = state.config.ship_schedule();
                            triggers = triggers.update(rotate, ship).await;
                        }
                        Err(e) => error!("Reload failed, keeping previous configuration: {e}"),
                    }
                }
                Some(tick) = triggers.rotate.tick() => {
                    if tick.slot.is_some() {
                        self.rotate_if_due(&tick.due_at()).await;
                    } else {
                        self.rotate_pass(false).await;
                    }
                }
                Some(_) = triggers.ship.tick() => {
                    self.ship_pass().await;
                }
            }
        }

        info!("Agent shutting down");
        triggers.stop().await;
        Ok(())
    }
}
