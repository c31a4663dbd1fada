//! In-tree test support: wires a client to the in-process mock cluster.

mod ops;
mod scenarios;

use std::sync::Arc;

use crate::client::Client;
use crate::testing::{MockCluster, MockFiler};

fn setup() -> (Arc<Client>, Arc<MockCluster>, Arc<MockFiler>) {
    crate::logger::init_logger();
    let cluster = MockCluster::new();
    let filer = MockFiler::new();
    let client = Client::new(cluster.clone(), filer.clone());
    cluster.attach(&client);
    (client, cluster, filer)
}
