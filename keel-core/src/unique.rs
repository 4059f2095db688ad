//! Unique constraints applied in the same transaction as the events that
//! declare them.

use serde::{Deserialize, Serialize};

/// What a [`UniqueConstraint`] does when its event is pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniqueAction {
    /// Claim `(unique_type, unique_field)` within the instance.
    Add,
    /// Release a previous claim.
    Remove,
    /// Release every claim of the instance.
    InstanceRemove,
}

/// A uniqueness side effect declared by a command.
///
/// Fields are compared case-insensitively: the constructors lowercase them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub unique_type: String,
    pub unique_field: String,
    pub action: UniqueAction,
    /// Surfaced verbatim in [`Error::AlreadyExists`](crate::error::Error)
    /// when an `Add` collides.
    pub error_message: String,
}

impl UniqueConstraint {
    #[must_use]
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl AsRef<str>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.as_ref().to_lowercase(),
            action: UniqueAction::Add,
            error_message: error_message.into(),
        }
    }

    #[must_use]
    pub fn remove(unique_type: impl Into<String>, unique_field: impl AsRef<str>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.as_ref().to_lowercase(),
            action: UniqueAction::Remove,
            error_message: String::new(),
        }
    }

    #[must_use]
    pub fn instance_remove() -> Self {
        Self {
            unique_type: String::new(),
            unique_field: String::new(),
            action: UniqueAction::InstanceRemove,
            error_message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_lowercased() {
        let add = UniqueConstraint::add("username", "Alice@Example.COM", "Errors.User.Taken");
        let remove = UniqueConstraint::remove("username", "ALICE@example.com");

        assert_eq!(add.unique_field, "alice@example.com");
        assert_eq!(add.unique_field, remove.unique_field);
        assert_eq!(add.error_message, "Errors.User.Taken");
    }
}
