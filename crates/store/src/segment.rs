use serde::{Deserialize, Serialize};

/// Reference number recorded for messages that are not concatenated.
const SINGLE_PART_REFERENCE: i64 = -1;

/// Logical key identifying every segment of one multi-part message.
///
/// Not persisted on its own; derived from segment columns on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub address: String,
    pub reference_number: i64,
    pub total_count: i64,
}

/// One physically received message fragment, as handed over by the transport
/// with timestamp, addressing, and concatenation metadata already extracted.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Raw payload bytes of this fragment.
    pub payload: Vec<u8>,
    /// Receive timestamp in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Destination port, or `None` for plain text messages.
    pub dest_port: Option<i64>,
    /// Transport format tag of the producing transport. Each format runs its
    /// own intake handler; recovery routes stored rows by this tag.
    pub format: String,
    /// Sender address used for grouping and deduplication.
    pub address: String,
    /// Address suitable for display; may differ from `address` behind gateways.
    pub display_address: String,
    /// Concatenation reference number; [`SINGLE_PART_REFERENCE`] for single parts.
    pub reference_number: i64,
    /// Sequence number of this fragment as received (see `index_offset`).
    pub sequence: i64,
    /// Declared number of fragments in the whole message.
    pub total_count: i64,
    /// Decoded message body, when the transport provides one.
    pub body_text: Option<String>,
    /// Display-without-storing class; delivered with foreground priority.
    pub priority: bool,
    /// Offset subtracted from `sequence` to obtain a 0-based slot index.
    /// Most transports number fragments from 1.
    pub index_offset: i64,
}

impl Segment {
    /// A message that fits a single fragment; always immediately complete.
    pub fn single(
        format: impl Into<String>,
        payload: Vec<u8>,
        timestamp_ms: i64,
        dest_port: Option<i64>,
        address: impl Into<String>,
        display_address: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            timestamp_ms,
            dest_port,
            format: format.into(),
            address: address.into(),
            display_address: display_address.into(),
            reference_number: SINGLE_PART_REFERENCE,
            sequence: 0,
            total_count: 1,
            body_text: None,
            priority: false,
            index_offset: 0,
        }
    }

    /// One fragment of a concatenated message, numbered from 1.
    #[allow(clippy::too_many_arguments)]
    pub fn concatenated(
        format: impl Into<String>,
        payload: Vec<u8>,
        timestamp_ms: i64,
        dest_port: Option<i64>,
        address: impl Into<String>,
        display_address: impl Into<String>,
        reference_number: i64,
        sequence: i64,
        total_count: i64,
    ) -> Self {
        Self {
            payload,
            timestamp_ms,
            dest_port,
            format: format.into(),
            address: address.into(),
            display_address: display_address.into(),
            reference_number,
            sequence,
            total_count,
            body_text: None,
            priority: false,
            index_offset: 1,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body_text = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the declared total marks this as a single-fragment message.
    pub fn is_single(&self) -> bool {
        self.total_count == 1
    }

    /// The group key shared by every fragment of the parent message.
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            address: self.address.clone(),
            reference_number: self.reference_number,
            total_count: self.total_count,
        }
    }
}

/// Rows-to-finalize selector computed when a segment is stored.
///
/// Single-fragment messages finalize their own row; multi-fragment messages
/// finalize the whole group in one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletePredicate {
    ById(i64),
    ByGroup(GroupKey),
}

/// A segment together with its durable row id and finalize predicate,
/// ready to be re-driven through the intake state machine.
#[derive(Debug, Clone)]
pub struct StoredSegment {
    pub segment: Segment,
    pub row_id: i64,
    pub delete: DeletePredicate,
}
