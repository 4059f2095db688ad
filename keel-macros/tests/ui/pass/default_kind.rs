extern crate self as keel;

#[path = "../common.rs"]
mod support;

pub use support::{event, unique};

use keel::event::DomainEvent as _;
use keel_macros::DomainEvent;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "user")]
pub struct UserPasswordChanged {
    hash: String,
}

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "org", kind = "org.renamed.v2")]
pub struct OrgRenamed {
    name: String,
}

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "user")]
pub struct UserLocked;

fn main() {
    assert_eq!(UserPasswordChanged::AGGREGATE_TYPE, "user");
    assert_eq!(UserPasswordChanged::EVENT_TYPE, "user.password.changed");
    assert_eq!(OrgRenamed::EVENT_TYPE, "org.renamed.v2");
    assert_eq!(UserLocked::EVENT_TYPE, "user.locked");
    assert!(UserLocked.unique_constraints().is_empty());
}
