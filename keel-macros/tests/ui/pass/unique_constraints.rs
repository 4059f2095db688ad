extern crate self as keel;

#[path = "../common.rs"]
mod support;

pub use support::{event, unique};

use keel::{event::DomainEvent as _, unique::UniqueConstraint};
use keel_macros::DomainEvent;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "user", unique = Self::claim_username)]
pub struct UserAdded {
    username: String,
}

impl UserAdded {
    fn claim_username(&self) -> Vec<UniqueConstraint> {
        vec![UniqueConstraint::add("username", &self.username, "Errors.User.Taken")]
    }
}

fn release(event: &UserRemoved) -> Vec<UniqueConstraint> {
    vec![UniqueConstraint::remove("username", &event.username)]
}

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "user", unique = release)]
pub struct UserRemoved {
    username: String,
}

fn main() {
    let added = UserAdded {
        username: "Alice".to_owned(),
    };
    assert_eq!(added.unique_constraints()[0].unique_field, "alice");

    let removed = UserRemoved {
        username: "alice".to_owned(),
    };
    assert_eq!(removed.unique_constraints().len(), 1);
}
