//! Prints the PostgresCluster CustomResourceDefinition as JSON
//!
//! `cargo run --bin crdgen | kubectl apply -f -`

use kube::CustomResourceExt;
use postgres_topology_operator::crd::PostgresCluster;

fn main() -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(&PostgresCluster::crd())?);
    Ok(())
}
