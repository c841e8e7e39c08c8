use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::{Future, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, NodeSpec};
use kube::{
    runtime::{
        reflector::{self, reflector, ObjectRef, Store},
        watcher::{self, watcher, Config},
    },
    Api, Client, ResourceExt,
};
use log::{debug, warn};

/// Read access to the node informer cache
pub trait NodeLister: Send + Sync {
    /// False until the initial list has been received
    fn has_synced(&self) -> bool;

    fn get(&self, name: &str) -> Option<Arc<Node>>;

    fn provider_id(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|node| node.spec.as_ref().and_then(|spec| spec.provider_id.to_owned()))
            .filter(|provider_id| !provider_id.is_empty())
    }
}

#[derive(Clone)]
pub struct NodeCache {
    store: Store<Node>,
    synced: Arc<AtomicBool>,
}

impl NodeLister for NodeCache {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.store.get(&ObjectRef::new(name))
    }
}

/// Watches cluster nodes, keeping only what the provider looks up: names and provider ids
pub fn start_node_reflector(client: &Client) -> (impl Future<Output = ()>, NodeCache) {
    let synced = Arc::new(AtomicBool::new(false));
    let watcher = watcher(Api::<Node>::all(client.to_owned()), Config::default()).map_ok(|event| {
        event.modify(|node| {
            node.managed_fields_mut().clear();
            node.annotations_mut().clear();
            node.labels_mut().clear();
            node.finalizers_mut().clear();
            node.owner_references_mut().clear();
            node.status = None;

            let provider_id = node
                .spec
                .as_ref()
                .and_then(|spec| spec.provider_id.to_owned());

            node.spec = Some(NodeSpec {
                provider_id,
                ..Default::default()
            })
        })
    });

    let (store, writer) = reflector::store();
    let synced_flag = synced.clone();
    let reflector = reflector(writer, watcher)
        .inspect_ok(move |event| {
            if let watcher::Event::Restarted(nodes) = event {
                debug!("Node cache (re)listed {} nodes.", nodes.len());
                synced_flag.store(true, Ordering::Release);
            }
        })
        .for_each(|event| {
            if let Err(error) = event {
                warn!("Node watcher failed! {error}");
            }
            std::future::ready(())
        });

    (reflector, NodeCache { store, synced })
}
