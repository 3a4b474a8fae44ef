//! Prints the Bamel CRD manifests as a multi-document YAML stream.
//!
//! `cargo run -p crds --bin crdgen > config/crd/bamel.yaml`

use crds::{BamelAutoscaler, BareMetalNode};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    println!("---");
    print!("{}", serde_yaml::to_string(&BareMetalNode::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&BamelAutoscaler::crd())?);
    Ok(())
}
