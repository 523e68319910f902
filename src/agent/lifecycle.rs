//! Install/activate state machine.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  /// Created, nothing done yet
  Parsed,
  Installing,
  /// Installed and waiting for activation
  Installed,
  Activating,
  Activated,
  /// Installation was abandoned
  Redundant,
}

/// Lifecycle bookkeeping for one agent version.
#[derive(Debug)]
pub struct Lifecycle {
  state: LifecycleState,
  /// Activation should not wait once installed
  skip_waiting: bool,
  /// Open pages are routed through the policy
  controlling: bool,
  navigation_preload: bool,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: LifecycleState::Parsed,
      skip_waiting: false,
      controlling: false,
      navigation_preload: false,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn is_controlling(&self) -> bool {
    self.controlling
  }

  pub fn navigation_preload(&self) -> bool {
    self.navigation_preload
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  pub fn begin_install(&mut self) -> Result<()> {
    match self.state {
      LifecycleState::Parsed | LifecycleState::Redundant => {
        self.state = LifecycleState::Installing;
        Ok(())
      }
      state => Err(eyre!("Cannot install from state {:?}", state)),
    }
  }

  /// Finish installing. A failed install makes this version redundant.
  pub fn finish_install(&mut self, success: bool) {
    if self.state != LifecycleState::Installing {
      return;
    }
    self.state = if success {
      LifecycleState::Installed
    } else {
      LifecycleState::Redundant
    };
  }

  /// Ask for activation without waiting.
  ///
  /// When installation has already finished this also moves to
  /// `Activating` and returns true; the caller then owns the activation.
  /// Repeated requests return false.
  pub fn request_skip_waiting(&mut self) -> bool {
    self.skip_waiting = true;
    if self.state != LifecycleState::Installed {
      return false;
    }
    self.state = LifecycleState::Activating;
    true
  }

  /// Installed and allowed to activate immediately.
  pub fn ready_to_activate(&self) -> bool {
    self.state == LifecycleState::Installed && self.skip_waiting
  }

  pub fn begin_activate(&mut self) -> Result<()> {
    match self.state {
      LifecycleState::Installed => {
        self.state = LifecycleState::Activating;
        Ok(())
      }
      state => Err(eyre!("Cannot activate from state {:?}", state)),
    }
  }

  /// Take over a generation that was activated by an earlier run,
  /// skipping install and activation.
  pub fn resume(&mut self, navigation_preload: bool) -> Result<()> {
    match self.state {
      LifecycleState::Parsed | LifecycleState::Installed => {
        self.state = LifecycleState::Activated;
        self.navigation_preload = navigation_preload;
        self.controlling = true;
        Ok(())
      }
      state => Err(eyre!("Cannot resume from state {:?}", state)),
    }
  }

  pub fn enable_navigation_preload(&mut self) {
    self.navigation_preload = true;
  }

  pub fn finish_activate(&mut self) {
    if self.state == LifecycleState::Activating {
      self.state = LifecycleState::Activated;
    }
  }

  /// Take control of open pages. Only an activated version can claim.
  pub fn claim(&mut self) -> Result<()> {
    if self.state != LifecycleState::Activated {
      return Err(eyre!("Cannot claim clients from state {:?}", self.state));
    }
    self.controlling = true;
    Ok(())
  }
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}
