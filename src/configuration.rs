/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [`Configuration`] type: the operator-specified parameters that are fixed at
//! startup.
//!
//! Changing any of these at runtime requires an externally-ordered reconfiguration, which is
//! outside the core's purview; the core only validates that the parameters are mutually consistent
//! on construction.

use std::time::Duration;

use crate::types::basic::BufferSize;
use crate::types::principals::AuthenticationScheme;

/// Configuration as specified by the operator.
#[derive(Clone)]
pub struct Configuration {
    /// n: the number of replicas.
    pub num_replicas: u32,
    /// f: the maximum number of faulty replicas tolerated. Must satisfy n >= 3f + 1.
    pub max_faulty: u32,
    /// L: the number of slots in the log window. Must be a positive multiple of the checkpoint
    /// interval.
    pub log_size: u64,
    /// K: a checkpoint is taken every K executed seqnos.
    pub checkpoint_interval: u64,
    /// How outbound messages are authenticated.
    pub authentication_scheme: AuthenticationScheme,
    /// Base duration of the view timer. Doubles on each successive view change without progress.
    pub view_timeout: Duration,
    /// Cadence of status broadcasts.
    pub status_interval: Duration,
    /// How long to wait for a fetched request body before re-issuing the fetch.
    pub fetch_timeout: Duration,
    /// How long to wait for a log sync response before retrying against another peer.
    pub recovery_timeout: Duration,
    /// The maximum number of requests batched into one Pre-Prepare.
    pub max_batch_size: usize,
    /// Buffers larger than this are rejected by the codec before parsing.
    pub max_message_size: usize,
    /// Requests with payloads at or above this size are referenced by digest inside Pre-Prepares
    /// instead of being inlined.
    pub big_request_threshold: usize,
    /// Entry count bound of the request table's evictable region.
    pub request_table_capacity: usize,
    /// Capacity of the future-view ordering message buffer.
    pub msg_buffer_capacity: BufferSize,
    /// The maximum number of ledger entries served in one log sync response.
    pub log_sync_request_limit: u32,
    /// Whether the default logging event handlers are installed.
    pub log_events: bool,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder {
            configuration: Configuration::default(),
        }
    }

    /// Check mutual consistency of the parameters.
    ///
    /// # Panics
    ///
    /// Panics with a description of the inconsistency, which is a configuration mistake the
    /// operator must fix before the replica can run at all.
    pub(crate) fn validate(&self) {
        assert!(
            self.num_replicas >= 3 * self.max_faulty + 1,
            "a replica group of {} cannot tolerate {} faults",
            self.num_replicas,
            self.max_faulty
        );
        assert!(self.checkpoint_interval > 0, "checkpoint interval must be positive");
        assert!(
            self.log_size >= self.checkpoint_interval && self.log_size % self.checkpoint_interval == 0,
            "the log window ({}) must be a positive multiple of the checkpoint interval ({})",
            self.log_size,
            self.checkpoint_interval
        );
        assert!(self.max_batch_size > 0, "batches must admit at least one request");
        assert!(self.max_message_size > 0, "the maximum message size must be positive");
    }
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            num_replicas: 4,
            max_faulty: 1,
            log_size: 256,
            checkpoint_interval: 128,
            authentication_scheme: AuthenticationScheme::Signatures,
            view_timeout: Duration::from_millis(2000),
            status_interval: Duration::from_millis(500),
            fetch_timeout: Duration::from_millis(500),
            recovery_timeout: Duration::from_millis(2000),
            max_batch_size: 64,
            max_message_size: 1 << 20,
            big_request_threshold: 4096,
            request_table_capacity: 16384,
            msg_buffer_capacity: BufferSize::new(1 << 20),
            log_sync_request_limit: 64,
            log_events: false,
        }
    }
}

/// Builder-pattern interface for [`Configuration`].
pub struct ConfigurationBuilder {
    configuration: Configuration,
}

impl ConfigurationBuilder {
    pub fn num_replicas(mut self, n: u32) -> ConfigurationBuilder {
        self.configuration.num_replicas = n;
        self
    }

    pub fn max_faulty(mut self, f: u32) -> ConfigurationBuilder {
        self.configuration.max_faulty = f;
        self
    }

    pub fn log_size(mut self, log_size: u64) -> ConfigurationBuilder {
        self.configuration.log_size = log_size;
        self
    }

    pub fn checkpoint_interval(mut self, interval: u64) -> ConfigurationBuilder {
        self.configuration.checkpoint_interval = interval;
        self
    }

    pub fn authentication_scheme(mut self, scheme: AuthenticationScheme) -> ConfigurationBuilder {
        self.configuration.authentication_scheme = scheme;
        self
    }

    pub fn view_timeout(mut self, timeout: Duration) -> ConfigurationBuilder {
        self.configuration.view_timeout = timeout;
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> ConfigurationBuilder {
        self.configuration.status_interval = interval;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> ConfigurationBuilder {
        self.configuration.fetch_timeout = timeout;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> ConfigurationBuilder {
        self.configuration.recovery_timeout = timeout;
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> ConfigurationBuilder {
        self.configuration.max_batch_size = max_batch_size;
        self
    }

    pub fn max_message_size(mut self, max_message_size: usize) -> ConfigurationBuilder {
        self.configuration.max_message_size = max_message_size;
        self
    }

    pub fn big_request_threshold(mut self, threshold: usize) -> ConfigurationBuilder {
        self.configuration.big_request_threshold = threshold;
        self
    }

    pub fn request_table_capacity(mut self, capacity: usize) -> ConfigurationBuilder {
        self.configuration.request_table_capacity = capacity;
        self
    }

    pub fn msg_buffer_capacity(mut self, capacity: BufferSize) -> ConfigurationBuilder {
        self.configuration.msg_buffer_capacity = capacity;
        self
    }

    pub fn log_sync_request_limit(mut self, limit: u32) -> ConfigurationBuilder {
        self.configuration.log_sync_request_limit = limit;
        self
    }

    pub fn log_events(mut self, log_events: bool) -> ConfigurationBuilder {
        self.configuration.log_events = log_events;
        self
    }

    pub fn build(self) -> Configuration {
        self.configuration
    }
}
