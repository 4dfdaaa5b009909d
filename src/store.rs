use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channels::Channel;
use crate::epg::ChannelProgramList;

/// The last good data set. Never mutated once published.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub channels: Vec<Channel>,
    pub epg: Vec<ChannelProgramList>,
    pub channels_updated_at: Option<DateTime<Utc>>,
    pub epg_updated_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn programs_of(&self, channel_name: &str) -> Option<&ChannelProgramList> {
        self.epg.iter().find(|p| p.channel_name == channel_name)
    }
}

/// Holds the current [`Snapshot`]. Readers take a cheap `Arc` clone and never see a
/// half-written update; writers build a replacement and swap it in.
#[derive(Debug, Default)]
pub struct Store {
    current: RwLock<Arc<Snapshot>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Replaces the channel list, keeping the current guide.
    pub fn publish_channels(&self, channels: Vec<Channel>, at: DateTime<Utc>) {
        let current = self.snapshot();
        self.publish(Snapshot {
            channels,
            epg: current.epg.clone(),
            channels_updated_at: Some(at),
            epg_updated_at: current.epg_updated_at,
        });
    }

    /// Replaces the guide, keeping the current channel list.
    pub fn publish_epg(&self, epg: Vec<ChannelProgramList>, at: DateTime<Utc>) {
        let current = self.snapshot();
        self.publish(Snapshot {
            channels: current.channels.clone(),
            epg,
            channels_updated_at: current.channels_updated_at,
            epg_updated_at: Some(at),
        });
    }
}
