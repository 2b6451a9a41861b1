use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientId);
id_newtype!(ParticipantId);
id_newtype!(FileId);

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The human operator using the dashboard.
    #[serde(alias = "user", alias = "human")]
    Operator,
    Assistant,
}

impl SenderRole {
    pub fn label(self) -> &'static str {
        match self {
            SenderRole::Operator => "operator",
            SenderRole::Assistant => "assistant",
        }
    }
}
