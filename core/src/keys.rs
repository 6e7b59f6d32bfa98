//! Identity keys for commands, groups and isolation pools

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Create a key from any string-like name
            pub fn new(name: impl AsRef<str>) -> Self {
                Self(Arc::from(name.as_ref()))
            }

            /// Key name
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(Arc::from(name))
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

key_type! {
    /// Logical grouping of commands, used for reporting and as the default pool
    GroupKey
}

key_type! {
    /// Identity of one logical operation; breaker state and stats are keyed by it
    CommandKey
}

key_type! {
    /// Identity of the resource pool a command runs on
    PoolKey
}

/// The key triple every command carries
///
/// The command key and pool key default to the group key's name.
///
/// ```rust
/// use command_machines::CommandKeys;
///
/// let keys = CommandKeys::with_group("payments")
///     .and_command_key("charge_card")
///     .and_pool_key("payments-io");
///
/// assert_eq!(keys.group().as_str(), "payments");
/// assert_eq!(keys.command().as_str(), "charge_card");
/// assert_eq!(keys.pool().as_str(), "payments-io");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandKeys {
    group: GroupKey,
    command: CommandKey,
    pool: PoolKey,
}

impl CommandKeys {
    pub fn with_group(group: impl AsRef<str>) -> Self {
        let name = group.as_ref();
        Self {
            group: GroupKey::new(name),
            command: CommandKey::new(name),
            pool: PoolKey::new(name),
        }
    }

    pub fn and_command_key(mut self, command: impl Into<CommandKey>) -> Self {
        self.command = command.into();
        self
    }

    pub fn and_pool_key(mut self, pool: impl Into<PoolKey>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    pub fn command(&self) -> &CommandKey {
        &self.command
    }

    pub fn pool(&self) -> &PoolKey {
        &self.pool
    }
}
