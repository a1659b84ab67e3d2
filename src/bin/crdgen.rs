//! CRD generator
//!
//! Usage: `cargo run --bin crdgen > deploy/crds.yaml`

use kube::CustomResourceExt;

use stand_schedule_controller::types::policy::StandSchedulePolicy;

fn main() {
    println!("# This file is autogenerated by `src/bin/crdgen.rs`");
    match serde_yaml::to_string(&StandSchedulePolicy::crd()) {
        Ok(yaml) => println!("{}", yaml),
        Err(error) => eprintln!("failed to render CRD: {error}"),
    }
}
