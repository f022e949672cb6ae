//! NATS-backed message bus
//!
//! Topics (`ambulance/1/data`) map onto NATS subjects
//! (`{prefix}.ambulance.1.data`). Retained publications are stored in a
//! JetStream key/value bucket with history 1, which keeps the last value per
//! topic; subscriptions watch the bucket with history so the latest value of
//! every matching key is delivered first. Non-retained publications use
//! core NATS publish.
//!
//! Segment bytes outside `[A-Za-z0-9_-]` are escaped as `=XX` so every topic
//! segment is a single valid subject token.

use super::bus::{MessageBus, Subscription};
use super::{BusMessage, QoS};
use crate::error::{Result, SyncError};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::future::ready;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

/// Message bus over a NATS server with JetStream enabled
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    retained: kv::Store,
    subject_prefix: String,
}

impl NatsBus {
    /// Bind to (or create) the key/value bucket holding retained topics
    pub async fn new(
        client: async_nats::Client,
        bucket: &str,
        subject_prefix: impl Into<String>,
    ) -> Result<Self> {
        let context = jetstream::new(client.clone());
        let retained = match context.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    SyncError::transport(format!("Failed to create bucket {}: {}", bucket, e))
                })?,
        };
        info!(bucket = %bucket, "Retained-topic bucket ready");

        Ok(Self {
            client,
            retained,
            subject_prefix: subject_prefix.into(),
        })
    }

    /// Build the core subject of a topic or filter
    pub fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic_to_key(topic))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn connect(&self) -> Result<()> {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => Ok(()),
            state => Err(SyncError::transport(format!(
                "NATS connection is {:?}",
                state
            ))),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        if retain {
            let key = topic_to_key(topic);
            if payload.is_empty() {
                self.retained.delete(&key).await.map_err(|e| {
                    SyncError::transport(format!("Failed to clear {}: {}", topic, e))
                })?;
            } else {
                self.retained.put(&key, payload.into()).await.map_err(|e| {
                    SyncError::transport(format!("Failed to store {}: {}", topic, e))
                })?;
            }
            debug!(topic = %topic, key = %key, "Retained message stored");
            return Ok(());
        }

        let subject = self.subject(topic);
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| SyncError::transport(format!("Failed to publish {}: {}", subject, e)))?;
        if qos > QoS::AtMostOnce {
            self.client
                .flush()
                .await
                .map_err(|e| SyncError::transport(format!("Failed to flush {}: {}", subject, e)))?;
        }
        debug!(subject = %subject, "Message published to NATS");
        Ok(())
    }

    async fn subscribe(&self, filters: &[String]) -> Result<Subscription> {
        let mut streams: Vec<Subscription> = Vec::with_capacity(filters.len() * 2);

        for filter in filters {
            let subject = self.subject(filter);
            let live = self.client.subscribe(subject.clone()).await.map_err(|e| {
                SyncError::transport(format!("Failed to subscribe {}: {}", subject, e))
            })?;
            let prefix = self.subject_prefix.clone();
            streams.push(Box::pin(live.filter_map(move |message| {
                let topic = subject_to_topic(&prefix, &message.subject.to_string());
                ready(topic.map(|topic| {
                    BusMessage::new(topic, message.payload.to_vec(), QoS::AtMostOnce, false)
                }))
            })));

            let key_filter = topic_to_key(filter);
            let watch = self
                .retained
                .watch_with_history(&key_filter)
                .await
                .map_err(|e| {
                    SyncError::transport(format!("Failed to watch {}: {}", key_filter, e))
                })?;
            streams.push(Box::pin(
                watch
                    .take_while(|entry| {
                        if let Err(e) = entry {
                            warn!("Retained-topic watch failed: {}", e);
                        }
                        ready(entry.is_ok())
                    })
                    .filter_map(|entry| {
                        ready(entry.ok().and_then(|entry| match entry.operation {
                            kv::Operation::Put => key_to_topic(&entry.key).map(|topic| {
                                BusMessage::new(topic, entry.value.to_vec(), QoS::AtLeastOnce, true)
                            }),
                            _ => None,
                        }))
                    }),
            ));
            debug!(subject = %subject, "Subscribed to NATS subject and retained bucket");
        }

        Ok(merge_until_first_end(streams))
    }
}

/// Merge streams; the merged stream ends as soon as any input ends, so a
/// lost watch or subscription surfaces as transport loss.
fn merge_until_first_end(streams: Vec<Subscription>) -> Subscription {
    let tagged = streams
        .into_iter()
        .map(|s| s.map(Some).chain(stream::once(ready(None))).boxed());
    stream::select_all(tagged)
        .take_while(|message| ready(message.is_some()))
        .filter_map(ready)
        .boxed()
}

/// Connect to a NATS server.
pub async fn connect_nats(url: &str) -> anyhow::Result<async_nats::Client> {
    let client = async_nats::connect(url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to NATS at {}: {}", url, e))?;
    info!("Connected to NATS at {}", url);
    Ok(client)
}

// ============================================================================
// Topic <-> subject mapping
// ============================================================================

fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("={:02X}", byte));
        }
    }
    out
}

fn unescape_segment(token: &str) -> Option<String> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            let hex = token.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Topic or filter to key/subject tokens (`+` → `*`, `#` → `>`)
pub fn topic_to_key(topic: &str) -> String {
    topic
        .split('/')
        .map(|segment| match segment {
            "+" => "*".to_string(),
            "#" => ">".to_string(),
            other => escape_segment(other),
        })
        .collect::<Vec<_>>()
        .join(".")
}

pub fn key_to_topic(key: &str) -> Option<String> {
    key.split('.')
        .map(unescape_segment)
        .collect::<Option<Vec<_>>>()
        .map(|segments| segments.join("/"))
}

pub fn subject_to_topic(prefix: &str, subject: &str) -> Option<String> {
    let key = subject.strip_prefix(prefix)?.strip_prefix('.')?;
    key_to_topic(key)
}
