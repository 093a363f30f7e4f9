use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Identifier newtypes for the persisted entities.
///
/// All entities carry a stable 64-bit integer primary key plus an opaque
/// 128-bit UUID that is what external systems see. The newtypes keep the
/// integer ids from being mixed up across tables.
macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
            Deserialize,
        )]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(OrgId);
id_type!(ContactId);
id_type!(UrnId);
id_type!(ChannelId);
id_type!(ChannelConnectionId);
id_type!(FlowId);
id_type!(GroupId);
id_type!(FieldId);
id_type!(TriggerId);
id_type!(MsgId);
id_type!(SessionId);
id_type!(RunId);
id_type!(StartId);
id_type!(TicketId);
id_type!(TopupId);

pub mod channels;
pub mod contacts;
pub mod fields;
pub mod flows;
pub mod groups;
pub mod msgs;
pub mod orgs;
pub mod runs;
pub mod sessions;
pub mod starts;
pub mod tickets;
pub mod triggers;

pub use channels::*;
pub use contacts::*;
pub use fields::*;
pub use flows::*;
pub use groups::*;
pub use msgs::*;
pub use orgs::*;
pub use runs::*;
pub use sessions::*;
pub use starts::*;
pub use tickets::*;
pub use triggers::*;
