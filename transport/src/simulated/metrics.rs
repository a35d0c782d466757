use crate::NodeId;
use prometheus_client::encoding::EncodeLabelSet;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub origin: String,
    pub recipient: String,
    pub kind: String,
}

impl Message {
    pub fn new(origin: NodeId, recipient: NodeId, kind: &'static str) -> Self {
        Self {
            origin: origin.to_string(),
            recipient: recipient.to_string(),
            kind: kind.to_string(),
        }
    }
}
