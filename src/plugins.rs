//! Construction and registration of sources and sinks.
//!
//! Each adapter is registered once per capability it implements, so a value
//! that is both a source and a sink shows up in both lists. Closing is
//! optional: only adapters registered through the `closable` variants (or
//! [`Plugins::add_closer`]) are closed on shutdown.

use crate::config::{Limit, PluginConfig};
use crate::console::{NullOutput, StdoutOutput};
use crate::error::Result;
use crate::input_file::FileInput;
use crate::limiter::Limiter;
use crate::output_file::FileOutput;
use crate::plugin::{Close, RecordSink, RecordSource};
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct Plugins {
    pub sources: Vec<Arc<dyn RecordSource>>,
    pub sinks: Vec<Arc<dyn RecordSink>>,
    pub closers: Vec<Arc<dyn Close>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source<T: RecordSource + 'static>(&mut self, plugin: T) -> Arc<T> {
        let p = Arc::new(plugin);
        self.sources.push(p.clone());
        p
    }

    pub fn add_sink<T: RecordSink + 'static>(&mut self, plugin: T) -> Arc<T> {
        let p = Arc::new(plugin);
        self.sinks.push(p.clone());
        p
    }

    pub fn add_closer(&mut self, closer: Arc<dyn Close>) {
        self.closers.push(closer);
    }

    pub fn add_closable_source<T: RecordSource + Close + 'static>(&mut self, plugin: T) -> Arc<T> {
        let p = self.add_source(plugin);
        self.closers.push(p.clone());
        p
    }

    pub fn add_closable_sink<T: RecordSink + Close + 'static>(&mut self, plugin: T) -> Arc<T> {
        let p = self.add_sink(plugin);
        self.closers.push(p.clone());
        p
    }

    /// Register something that is both a source and a sink.
    pub fn add_duplex<T: RecordSource + RecordSink + Close + 'static>(&mut self, plugin: T) -> Arc<T> {
        let p = self.add_closable_source(plugin);
        self.sinks.push(p.clone());
        p
    }

    fn source<T: RecordSource + Close + 'static>(&mut self, plugin: T, limit: Option<Limit>) {
        match limit {
            Some(limit) => {
                self.add_closable_source(Limiter::new(plugin, limit));
            }
            None => {
                self.add_closable_source(plugin);
            }
        }
    }

    fn sink<T: RecordSink + Close + 'static>(&mut self, plugin: T, limit: Option<Limit>) {
        match limit {
            Some(limit) => {
                self.add_closable_sink(Limiter::new(plugin, limit));
            }
            None => {
                self.add_closable_sink(plugin);
            }
        }
    }

    /// Build every configured plugin, wrapping it in a [`Limiter`] when it
    /// carries a limit. Fails on the first plugin that cannot be constructed,
    /// closing whatever was already built.
    pub fn build(configs: &[PluginConfig]) -> Result<Plugins> {
        let mut plugins = Plugins::new();
        for cfg in configs {
            if let Err(e) = plugins.register(cfg) {
                plugins.close_all();
                return Err(e);
            }
        }
        Ok(plugins)
    }

    fn register(&mut self, cfg: &PluginConfig) -> Result<()> {
        let limit = cfg.limit();
        match cfg {
            PluginConfig::InputFile { pattern, options, .. } => {
                self.source(FileInput::new(pattern, options.clone())?, limit);
            }
            PluginConfig::OutputFile { path, options, .. } => {
                self.sink(FileOutput::new(path, options.clone())?, limit);
            }
            PluginConfig::OutputStdout { .. } => self.sink(StdoutOutput::new(), limit),
            PluginConfig::OutputNull { .. } => match limit {
                Some(limit) => {
                    self.add_sink(Limiter::new(NullOutput::new(), limit));
                }
                None => {
                    self.add_sink(NullOutput::new());
                }
            },
        }
        Ok(())
    }

    pub fn close_all(&self) {
        for c in &self.closers {
            c.close();
        }
    }
}
