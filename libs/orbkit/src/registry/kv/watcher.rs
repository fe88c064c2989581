use async_trait::async_trait;
use orbkit_errors::OrbError;

use super::{KvEvent, KvOperation, KvWatch, Layout};
use crate::registry::{Event, EventAction, Node, Service, WatchOptions, Watcher, watcher_stopped};

/// Turns key-value changes into registry events.
///
/// Writes carry the full node. Deletes only carry the key, so the reported
/// service holds a skeletal node with nothing but its id.
pub struct KvWatcher {
    watch: KvWatch,
    layout: Layout,
    opts: WatchOptions,
    stopped: bool,
}

impl KvWatcher {
    pub(super) fn new(watch: KvWatch, layout: Layout, opts: WatchOptions) -> Self {
        Self {
            watch,
            layout,
            opts,
            stopped: false,
        }
    }

    fn translate(&self, event: KvEvent) -> Result<Event, OrbError> {
        let action = match event.operation {
            KvOperation::Create => EventAction::Create,
            KvOperation::Update => EventAction::Update,
            KvOperation::Delete | KvOperation::Purge => EventAction::Delete,
        };

        if let Some(value) = event.value {
            let entry = self.layout.decode(&value)?;
            return Ok(Event {
                action,
                service: Service {
                    name: entry.name,
                    version: entry.version,
                    metadata: entry.metadata,
                    endpoints: entry.endpoints,
                    nodes: vec![entry.node],
                },
            });
        }

        let (name, id, version) = self
            .layout
            .registry_key(&event.key)
            .and_then(|k| self.layout.parse_key(k))
            .ok_or_else(|| OrbError::BAD_REQUEST.wrap(format!("invalid service key '{}'", event.key)))?;
        Ok(Event {
            action,
            service: Service {
                name: name.to_owned(),
                version: version.to_owned(),
                nodes: vec![Node {
                    id: id.to_owned(),
                    ..Node::default()
                }],
                ..Service::default()
            },
        })
    }
}

#[async_trait]
impl Watcher for KvWatcher {
    async fn next(&mut self) -> Result<Event, OrbError> {
        loop {
            if self.stopped {
                return Err(watcher_stopped());
            }
            let Some(raw) = self.watch.recv().await else {
                self.stopped = true;
                return Err(watcher_stopped());
            };
            match self.translate(raw) {
                Ok(event) if self.opts.matches(&event.service.name) => return Ok(event),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "dropping untranslatable registry change");
                }
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.watch.close();
    }
}
