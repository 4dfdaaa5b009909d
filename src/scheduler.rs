use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::Token;
use crate::channels::Channel;
use crate::client::Client;
use crate::clock::Clock;
use crate::epg::EpgVariant;
use crate::error::IptvError;
use crate::metrics;
use crate::store::Store;

pub const CHANNEL_ATTEMPTS: u32 = 3;
pub const RETRY_WAIT: Duration = Duration::from_secs(30);

/// One full acquisition: authenticate, load channels, load the guide, publish.
///
/// Owns the session and the EPG variant discovered by earlier cycles.
pub struct Pipeline {
    client: Client,
    store: Arc<Store>,
    variant: Option<EpgVariant>,
}

impl Pipeline {
    pub fn new(client: Client, store: Arc<Store>) -> Self {
        let variant = client.config.epg_variant;
        Self { client, store, variant }
    }

    pub fn variant(&self) -> Option<EpgVariant> {
        self.variant
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.client.clock)
    }

    /// Runs the channel step then the guide step. A guide failure never discards the
    /// channel list just published.
    pub async fn refresh(&mut self) -> anyhow::Result<()> {
        let token = match self.refresh_channels_with_retry().await {
            Ok(token) => Some(token),
            Err(e) if self.cancelled() => return Err(e),
            Err(e) => {
                error!("Failed to update channel list: err={}", e);
                None
            }
        };

        if let Err(e) = self.refresh_epg(token).await {
            error!("Failed to update EPG: err={}", e);
        }

        if self.store.snapshot().channels.is_empty() {
            return Err(anyhow!("no channels available"));
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.client.cancellation().is_cancelled()
    }

    /// Up to [`CHANNEL_ATTEMPTS`] tries, [`RETRY_WAIT`] apart. Cancellation ends the
    /// loop at once, including during the wait.
    pub async fn refresh_channels_with_retry(&mut self) -> anyhow::Result<Token> {
        let clock = self.clock();
        let cancel = self.client.cancellation().clone();
        let mut attempt = 1;
        loop {
            match self.refresh_channels().await {
                Ok(token) => return Ok(token),
                Err(e) if attempt >= CHANNEL_ATTEMPTS || cancel.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to update channel list, retrying in {}s: attempt={} err={}",
                        RETRY_WAIT.as_secs(),
                        attempt,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(IptvError::Cancelled.into()),
                        _ = clock.sleep(RETRY_WAIT) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Authenticates and replaces the channel list. Returns the session for reuse.
    pub async fn refresh_channels(&mut self) -> anyhow::Result<Token> {
        let result = self.load_channels().await;
        let now = self.client.clock.now();
        metrics::record_refresh("channels", result.is_ok(), now.timestamp());

        let (token, channels) = result?;
        info!("The channel list has been updated: rows={}", channels.len());
        metrics::CHANNELS.set(channels.len() as i64);
        self.store.publish_channels(channels, now);
        Ok(token)
    }

    async fn load_channels(&mut self) -> anyhow::Result<(Token, Vec<Channel>)> {
        let token = self.client.request_token().await?;
        let channels = self.client.fetch_channels(&token).await?;
        if channels.is_empty() {
            return Err(anyhow!("no channels found"));
        }
        Ok((token, channels))
    }

    /// Loads the guide for the channels currently published. Without a session from
    /// the channel step a new one is requested.
    pub async fn refresh_epg(&mut self, token: Option<Token>) -> anyhow::Result<()> {
        if self.cancelled() {
            return Err(IptvError::Cancelled.into());
        }
        let snapshot = self.store.snapshot();
        if snapshot.channels.is_empty() {
            return Err(anyhow!("no channels"));
        }

        let result = self.load_epg(token, &snapshot.channels).await;
        let now = self.client.clock.now();
        metrics::record_refresh("epg", result.is_ok(), now.timestamp());

        let epg = result?;
        info!("EPG data updated: rows={}", epg.len());
        metrics::EPG_CHANNELS.set(epg.len() as i64);
        self.store.publish_epg(epg, now);
        Ok(())
    }

    async fn load_epg(
        &mut self,
        token: Option<Token>,
        channels: &[Channel],
    ) -> anyhow::Result<Vec<crate::epg::ChannelProgramList>> {
        let token = match token {
            Some(token) => token,
            None => self.client.request_token().await?,
        };
        let (variant, epg) = self
            .client
            .fetch_all_programs(&token, channels, self.variant)
            .await?;
        if self.variant.is_none() {
            if let Some(variant) = variant {
                info!("Remembering EPG variant: variant={}", variant);
                self.variant = Some(variant);
            }
        }
        Ok(epg)
    }
}

/// Re-runs the [`Pipeline`] every `interval` until cancelled. A cycle in progress is
/// not interrupted by the loop itself; in-flight requests abort through the client.
pub struct Scheduler {
    pipeline: Pipeline,
    interval: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            interval,
            cancel,
        }
    }

    pub async fn run(mut self) -> Pipeline {
        let clock = self.pipeline.clock();
        info!("Scheduler started: interval={}s", self.interval.as_secs());
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = clock.sleep(self.interval) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }

            info!("Start executing the scheduled refresh");
            if let Err(e) = self.pipeline.refresh().await {
                warn!("Scheduled refresh incomplete: err={}", e);
            }
            info!("The scheduled refresh has been completed");
        }
        info!("The scheduling task has been stopped");
        self.pipeline
    }
}
