use std::collections::HashMap;
use std::sync::Arc;

use netcon_rpc::RpcBlock;

use crate::channel::{AppChannel, ChannelId};

/// A staged command waiting for its data channel to present the token.
pub(crate) struct PendingJob {
    /// Where the reply goes.
    pub channel: Arc<dyn AppChannel>,
    pub block: RpcBlock,
}

/// Staged commands keyed by correlation token. A token is present at most once.
#[derive(Default)]
pub(crate) struct PendingJobs {
    jobs: HashMap<u64, PendingJob>,
}

impl PendingJobs {
    /// Stages a job. A token already in use is refused and the job handed back.
    pub fn insert(&mut self, token: u64, job: PendingJob) -> Result<(), PendingJob> {
        if self.jobs.contains_key(&token) {
            return Err(job);
        }
        self.jobs.insert(token, job);
        Ok(())
    }

    pub fn get(&self, token: u64) -> Option<&PendingJob> {
        self.jobs.get(&token)
    }

    pub fn take(&mut self, token: u64) -> Option<PendingJob> {
        self.jobs.remove(&token)
    }

    pub fn contains(&self, token: u64) -> bool {
        self.jobs.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Drops every job whose reply channel is `channel`, returning their tokens.
    pub fn remove_for_channel(&mut self, channel: ChannelId) -> Vec<u64> {
        let tokens: Vec<u64> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.channel.id() == channel)
            .map(|(token, _)| *token)
            .collect();
        for token in &tokens {
            self.jobs.remove(token);
        }
        tokens
    }

    pub fn drain(&mut self) -> Vec<PendingJob> {
        self.jobs.drain().map(|(_, job)| job).collect()
    }
}
