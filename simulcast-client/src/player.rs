//! Player abstraction and double-buffered player pair
//!
//! The embedding application provides the actual media player behind the
//! [`Player`] trait. The client keeps two player instances and alternates
//! between them: the inactive one preloads the next playlist item while
//! the active one plays, so an item boundary is a swap of roles rather
//! than a teardown and recreation. Player handles are created once and
//! live for the whole broadcast.

use async_trait::async_trait;
use simulcast_common::media::PlaybackTokens;
use simulcast_common::Result;
use tracing::{debug, info};

/// What a player slot is asked to load
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSource {
    pub media_id: String,
    /// Present when the item required signed access
    pub tokens: Option<PlaybackTokens>,
}

impl PlaybackSource {
    pub fn public(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            tokens: None,
        }
    }

    pub fn signed(media_id: impl Into<String>, tokens: PlaybackTokens) -> Self {
        Self {
            media_id: media_id.into(),
            tokens: Some(tokens),
        }
    }
}

/// Minimal surface the sync controller needs from a media player
#[async_trait]
pub trait Player: Send + Sync {
    async fn load(&mut self, source: &PlaybackSource) -> Result<()>;
    async fn play(&mut self) -> Result<()>;
    async fn pause(&mut self) -> Result<()>;
    async fn seek(&mut self, position_secs: f64) -> Result<()>;
    async fn position_secs(&self) -> Result<f64>;
    async fn is_paused(&self) -> Result<bool>;
}

/// Which player slot is currently active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSlot {
    A,
    B,
}

impl ActiveSlot {
    /// Get the other slot
    pub fn other(&self) -> Self {
        match self {
            ActiveSlot::A => ActiveSlot::B,
            ActiveSlot::B => ActiveSlot::A,
        }
    }
}

/// Two player instances alternating between playing and preloading
pub struct PlayerPair {
    player_a: Box<dyn Player>,
    player_b: Box<dyn Player>,
    active: ActiveSlot,
    /// Source currently loaded in each slot, if any
    loaded_a: Option<PlaybackSource>,
    loaded_b: Option<PlaybackSource>,
}

impl PlayerPair {
    pub fn new(player_a: Box<dyn Player>, player_b: Box<dyn Player>) -> Self {
        Self {
            player_a,
            player_b,
            active: ActiveSlot::A,
            loaded_a: None,
            loaded_b: None,
        }
    }

    pub fn active_slot(&self) -> ActiveSlot {
        self.active
    }

    pub fn active(&mut self) -> &mut dyn Player {
        self.slot_mut(self.active)
    }

    pub fn inactive(&mut self) -> &mut dyn Player {
        self.slot_mut(self.active.other())
    }

    /// Media currently loaded in the active slot
    pub fn active_source(&self) -> Option<&PlaybackSource> {
        self.loaded(self.active)
    }

    /// Media currently loaded in the inactive slot
    pub fn inactive_source(&self) -> Option<&PlaybackSource> {
        self.loaded(self.active.other())
    }

    /// Load `source` into the inactive slot unless it is already there
    pub async fn preload(&mut self, source: &PlaybackSource) -> Result<()> {
        if self.inactive_source() == Some(source) {
            return Ok(());
        }
        debug!(
            "Preloading '{}' into slot {:?}",
            source.media_id,
            self.active.other()
        );
        self.inactive().load(source).await?;
        *self.loaded_mut(self.active.other()) = Some(source.clone());
        Ok(())
    }

    /// Load `source` directly into the active slot, replacing its content
    pub async fn load_active(&mut self, source: &PlaybackSource) -> Result<()> {
        if self.active_source() == Some(source) {
            return Ok(());
        }
        self.active().load(source).await?;
        *self.loaded_mut(self.active) = Some(source.clone());
        Ok(())
    }

    /// Swap roles: pause the outgoing player, make the preloaded slot
    /// active. Neither handle is recreated.
    pub async fn swap(&mut self) -> Result<()> {
        self.active().pause().await?;
        self.active = self.active.other();
        info!("Swapped to slot {:?}", self.active);
        Ok(())
    }

    fn slot_mut(&mut self, slot: ActiveSlot) -> &mut dyn Player {
        match slot {
            ActiveSlot::A => self.player_a.as_mut(),
            ActiveSlot::B => self.player_b.as_mut(),
        }
    }

    fn loaded(&self, slot: ActiveSlot) -> Option<&PlaybackSource> {
        match slot {
            ActiveSlot::A => self.loaded_a.as_ref(),
            ActiveSlot::B => self.loaded_b.as_ref(),
        }
    }

    fn loaded_mut(&mut self, slot: ActiveSlot) -> &mut Option<PlaybackSource> {
        match slot {
            ActiveSlot::A => &mut self.loaded_a,
            ActiveSlot::B => &mut self.loaded_b,
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Scriptless mock: records commands, tracks position/pause state
    #[derive(Default)]
    pub struct MockState {
        pub commands: Vec<String>,
        pub position_secs: f64,
        pub paused: bool,
        pub loaded: Option<String>,
    }

    #[derive(Clone, Default)]
    pub struct MockPlayer {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockPlayer {
        pub fn commands(&self) -> Vec<String> {
            self.state.lock().unwrap().commands.clone()
        }

        pub fn set_position(&self, position_secs: f64) {
            self.state.lock().unwrap().position_secs = position_secs;
        }

        pub fn set_paused(&self, paused: bool) {
            self.state.lock().unwrap().paused = paused;
        }
    }

    #[async_trait]
    impl Player for MockPlayer {
        async fn load(&mut self, source: &PlaybackSource) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.commands.push(format!("load:{}", source.media_id));
            state.loaded = Some(source.media_id.clone());
            state.paused = true;
            state.position_secs = 0.0;
            Ok(())
        }

        async fn play(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.commands.push("play".into());
            state.paused = false;
            Ok(())
        }

        async fn pause(&mut self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.commands.push("pause".into());
            state.paused = true;
            Ok(())
        }

        async fn seek(&mut self, position_secs: f64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.commands.push(format!("seek:{position_secs:.1}"));
            state.position_secs = position_secs;
            Ok(())
        }

        async fn position_secs(&self) -> Result<f64> {
            Ok(self.state.lock().unwrap().position_secs)
        }

        async fn is_paused(&self) -> Result<bool> {
            Ok(self.state.lock().unwrap().paused)
        }
    }
}
