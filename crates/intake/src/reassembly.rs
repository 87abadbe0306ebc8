use {
    courier_store::{DeletePredicate, SegmentStore, StoredSegment},
    tracing::{error, warn},
};

use crate::Result;

/// A message whose fragments have all arrived, ready for filtering.
#[derive(Debug)]
pub struct ReassembledMessage {
    /// Fragment payloads in sequence order.
    pub payloads: Vec<Vec<u8>>,
    pub format: String,
    pub dest_port: Option<i64>,
    pub address: String,
    pub timestamp_ms: i64,
    pub priority: bool,
    /// Rows to finalize once the message has been handed off.
    pub delete: DeletePredicate,
}

/// Try to assemble the message the given fragment belongs to.
///
/// Returns `Ok(None)` while fragments are still missing. Fragments whose
/// sequence number falls outside the declared range are logged and skipped
/// rather than trusted; a group poisoned that way stays incomplete until the
/// expiry sweep removes it.
pub async fn try_complete(
    store: &SegmentStore,
    stored: &StoredSegment,
) -> Result<Option<ReassembledMessage>> {
    let segment = &stored.segment;

    if segment.is_single() {
        return Ok(Some(ReassembledMessage {
            payloads: vec![segment.payload.clone()],
            format: segment.format.clone(),
            dest_port: segment.dest_port,
            address: segment.display_address.clone(),
            timestamp_ms: segment.timestamp_ms,
            priority: segment.priority,
            delete: stored.delete.clone(),
        }));
    }

    let total = segment.total_count;
    if total <= 0 {
        error!(total, "fragment declares a non-positive count, never dispatching");
        return Ok(None);
    }

    let key = segment.group_key();
    let rows = store.group_rows(&key).await?;
    if (rows.len() as i64) < total {
        return Ok(None);
    }

    let mut slots: Vec<Option<Vec<u8>>> = std::iter::repeat_with(|| None)
        .take(total as usize)
        .collect();
    let mut dest_port = segment.dest_port;
    let mut timestamp_ms = segment.timestamp_ms;
    let mut address = segment.display_address.clone();

    for row in rows {
        let index = row.sequence - segment.index_offset;
        let Ok(index) = usize::try_from(index) else {
            warn!(sequence = row.sequence, total, "fragment sequence below range, skipping");
            continue;
        };
        if index >= total as usize {
            warn!(sequence = row.sequence, total, "fragment sequence above range, skipping");
            continue;
        }
        if index == 0 {
            // The first fragment is authoritative for port and sender.
            if row.destination_port.is_some() {
                dest_port = row.destination_port;
            }
            timestamp_ms = row.timestamp_ms;
            address = row.display_address;
        }
        slots[index] = Some(row.payload);
    }

    let mut payloads = Vec::with_capacity(total as usize);
    for slot in slots {
        match slot {
            Some(payload) => payloads.push(payload),
            None => return Ok(None),
        }
    }

    Ok(Some(ReassembledMessage {
        payloads,
        format: segment.format.clone(),
        dest_port,
        address,
        timestamp_ms,
        priority: segment.priority,
        delete: stored.delete.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use courier_store::{InsertOutcome, Segment, SegmentStore};

    use super::*;

    async fn test_store() -> SegmentStore {
        SegmentStore::connect("sqlite::memory:").await.unwrap()
    }

    async fn insert(store: &SegmentStore, segment: &Segment) -> StoredSegment {
        match store.insert(segment).await.unwrap() {
            InsertOutcome::Accepted(stored) => stored,
            InsertOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    fn part(sequence: i64, total: i64, payload: &[u8]) -> Segment {
        Segment::concatenated(
            "text",
            payload.to_vec(),
            1_000 + sequence,
            None,
            "+15550001",
            "+15550001",
            7,
            sequence,
            total,
        )
    }

    #[tokio::test]
    async fn test_single_fragment_completes_immediately() {
        let store = test_store().await;
        let stored = insert(
            &store,
            &Segment::single("text", b"hi".to_vec(), 5, Some(2948), "+1555", "+1555")
                .with_priority(true),
        )
        .await;

        let message = try_complete(&store, &stored).await.unwrap().unwrap();
        assert_eq!(message.payloads, vec![b"hi".to_vec()]);
        assert_eq!(message.format, "text");
        assert_eq!(message.dest_port, Some(2948));
        assert!(message.priority);
    }

    #[tokio::test]
    async fn test_incomplete_group_returns_none() {
        let store = test_store().await;
        let stored = insert(&store, &part(1, 3, b"a")).await;
        assert!(try_complete(&store, &stored).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_assembles_in_sequence() {
        let store = test_store().await;
        insert(&store, &part(3, 3, b"c")).await;
        insert(&store, &part(1, 3, b"a")).await;
        let stored = insert(&store, &part(2, 3, b"b")).await;

        let message = try_complete(&store, &stored).await.unwrap().unwrap();
        assert_eq!(
            message.payloads,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_port_and_address_come_from_first_fragment() {
        let store = test_store().await;
        let mut first = part(1, 2, b"a");
        first.dest_port = Some(16_962);
        first.display_address = "Gateway".into();
        insert(&store, &first).await;
        let stored = insert(&store, &part(2, 2, b"b")).await;

        let message = try_complete(&store, &stored).await.unwrap().unwrap();
        assert_eq!(message.dest_port, Some(16_962));
        assert_eq!(message.address, "Gateway");
    }

    #[tokio::test]
    async fn test_out_of_range_sequence_is_skipped() {
        let store = test_store().await;
        insert(&store, &part(1, 2, b"a")).await;
        // A corrupt header claims sequence 9 of 2. The group appears full by
        // count but the second slot never fills.
        let stored = insert(&store, &part(9, 2, b"junk")).await;
        assert!(try_complete(&store, &stored).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_positive_count_never_dispatches() {
        let store = test_store().await;
        let stored = insert(&store, &part(1, 3, b"a")).await;
        let mut broken = stored.clone();
        broken.segment.total_count = 0;
        assert!(try_complete(&store, &broken).await.unwrap().is_none());
    }
}
