// src/sources/memory.rs
//! In-process collaborators for the demo binary and tests.

use anyhow::Result;
use std::sync::Mutex;

use crate::model::{Article, Subscription};
use crate::sources::{ArticleSink, SubscriptionDirectory};

/// Fixed subscription list.
pub struct StaticDirectory {
    subs: Mutex<Vec<Subscription>>,
}

impl StaticDirectory {
    pub fn new(subs: Vec<Subscription>) -> Self {
        Self {
            subs: Mutex::new(subs),
        }
    }

    pub fn replace(&self, subs: Vec<Subscription>) {
        *self.subs.lock().expect("directory mutex poisoned") = subs;
    }
}

#[async_trait::async_trait]
impl SubscriptionDirectory for StaticDirectory {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.subs.lock().expect("directory mutex poisoned").clone())
    }

    fn name(&self) -> &'static str {
        "static-directory"
    }
}

/// Records every batch it is asked to save.
#[derive(Default)]
pub struct MemorySink {
    pub calls: Mutex<Vec<Vec<Article>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<Article> {
        self.calls
            .lock()
            .expect("sink mutex poisoned")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ArticleSink for MemorySink {
    async fn save(&self, articles: &[Article]) -> Result<()> {
        self.calls
            .lock()
            .expect("sink mutex poisoned")
            .push(articles.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory-sink"
    }
}
