//! Integration tests for the optimistic segment piece update.

use chrono::Utc;
use futures::future::join_all;
use metabase::{
    Metabase, MetabaseError, NodeId, ObjectStatus, Piece, Pieces, SegmentPosition,
    UpdateSegmentPieces,
    models::{object::LATEST_VERSION, segment::encode_piece_numbers},
    services::batch_writer::{BatchWriter, ObjectRow, SegmentRow},
};
use uuid::Uuid;

async fn test_metabase() -> Metabase {
    let metabase = Metabase::connect("sqlite::memory:", 1).await.unwrap();
    metabase.migrate_schema().await.unwrap();
    metabase
}

fn random_node_id() -> NodeId {
    let mut id = [0u8; 32];
    id[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    id[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    NodeId(id)
}

fn random_pieces(numbers: &[u16]) -> Pieces {
    numbers
        .iter()
        .map(|number| Piece {
            number: *number,
            storage_node: random_node_id(),
        })
        .collect()
}

fn valid_pieces() -> Pieces {
    random_pieces(&[1])
}

/// Writes an object with `count` remote segments at positions (0, 0..count).
async fn create_object(metabase: &Metabase, stream_id: Uuid, count: u32) {
    let positions: Vec<SegmentPosition> = (0..count).map(|i| SegmentPosition::new(0, i)).collect();
    create_object_at(metabase, stream_id, &positions).await;
}

async fn create_object_at(metabase: &Metabase, stream_id: Uuid, positions: &[SegmentPosition]) {
    let count = positions.len() as u32;
    let mut writer = BatchWriter::new(metabase.db.clone(), 10, 10);
    writer
        .push_object(ObjectRow {
            project_id: Uuid::new_v4(),
            bucket_name: "bucket".into(),
            encrypted_path: b"object".to_vec(),
            version: LATEST_VERSION,
            stream_id,
            created_at: Utc::now(),
            expires_at: None,
            status: ObjectStatus::Committed,
            segment_count: count as i32,
            encrypted_metadata: None,
            total_encrypted_size: 1024 * i64::from(count),
            fixed_segment_size: 1024,
            encryption: 0,
        })
        .await
        .unwrap();

    for (index, position) in (0u32..).zip(positions) {
        let pieces = random_pieces(&[0, 1, 2]);
        let nodes: Vec<NodeId> = pieces.iter().map(|p| p.storage_node).collect();
        let aliases = metabase.aliases().ensure_nodes(&nodes).await.unwrap();
        writer
            .push_segment(SegmentRow {
                stream_id,
                position: *position,
                root_piece_id: vec![index as u8; 32],
                encrypted_key_nonce: vec![1; 24],
                encrypted_key: vec![2; 48],
                encrypted_size: 1024,
                inline_data: None,
                piece_numbers: encode_piece_numbers(&pieces),
                node_aliases: aliases.encode(),
            })
            .await
            .unwrap();
    }
    writer.finish().await.unwrap();
}

async fn raw_pieces(metabase: &Metabase, stream_id: Uuid, position: SegmentPosition) -> (Vec<u8>, Vec<u8>) {
    sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(
        "SELECT piece_numbers, node_aliases FROM segments WHERE stream_id = ? AND position = ?",
    )
    .bind(stream_id)
    .bind(position.to_db())
    .fetch_one(&*metabase.db)
    .await
    .unwrap()
}

fn assert_invalid(result: Result<(), MetabaseError>, text: &str) {
    match result {
        Err(MetabaseError::InvalidRequest(message)) => assert_eq!(message, text),
        other => panic!("expected invalid request `{}`, got {:?}", text, other),
    }
}

#[tokio::test]
async fn test_list_segments_orders_high_parts_last() {
    let metabase = test_metabase().await;
    let stream_id = Uuid::new_v4();
    let high = SegmentPosition::new(1 << 31, 0);
    let highest = SegmentPosition::new(u32::MAX, 7);
    create_object_at(
        &metabase,
        stream_id,
        &[highest, high, SegmentPosition::new(0, 0), SegmentPosition::new(1, 2)],
    )
    .await;

    let positions: Vec<SegmentPosition> = metabase
        .list_segments(stream_id)
        .await
        .unwrap()
        .into_iter()
        .map(|segment| segment.position)
        .collect();
    assert_eq!(
        positions,
        vec![
            SegmentPosition::new(0, 0),
            SegmentPosition::new(1, 2),
            high,
            highest
        ]
    );
    assert_eq!(
        metabase.get_segment_by_position(stream_id, high).await.unwrap().position,
        high
    );
}

#[tokio::test]
async fn test_stream_id_missing() {
    let metabase = test_metabase().await;
    let result = metabase
        .update_segment_pieces(UpdateSegmentPieces::default())
        .await;
    assert_invalid(result, "StreamID missing");
}

#[tokio::test]
async fn test_invalid_old_pieces() {
    let metabase = test_metabase().await;
    let stream_id = Uuid::new_v4();

    let cases = vec![
        (Vec::new(), "OldPieces: pieces missing"),
        (
            vec![Piece {
                number: 1,
                storage_node: NodeId::default(),
            }],
            "OldPieces: piece number 1 is missing storage node id",
        ),
        (random_pieces(&[1, 1]), "OldPieces: duplicated piece number 1"),
        (random_pieces(&[2, 1]), "OldPieces: pieces should be ordered"),
    ];

    for (old_pieces, text) in cases {
        let result = metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id,
                old_pieces,
                ..Default::default()
            })
            .await;
        assert_invalid(result, text);
    }
}

#[tokio::test]
async fn test_invalid_new_pieces() {
    let metabase = test_metabase().await;
    let stream_id = Uuid::new_v4();

    let cases = vec![
        (Vec::new(), "NewPieces: pieces missing"),
        (
            vec![Piece {
                number: 1,
                storage_node: NodeId::default(),
            }],
            "NewPieces: piece number 1 is missing storage node id",
        ),
        (random_pieces(&[1, 1]), "NewPieces: duplicated piece number 1"),
        (random_pieces(&[2, 1]), "NewPieces: pieces should be ordered"),
    ];

    for (new_pieces, text) in cases {
        let result = metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id,
                old_pieces: valid_pieces(),
                new_pieces,
                ..Default::default()
            })
            .await;
        assert_invalid(result, text);
    }
}

#[tokio::test]
async fn test_validation_happens_before_storage() {
    // No schema: any query would fail with a database error.
    let metabase = Metabase::connect("sqlite::memory:", 1).await.unwrap();

    let result = metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id: Uuid::new_v4(),
            old_pieces: valid_pieces(),
            new_pieces: random_pieces(&[3, 2]),
            ..Default::default()
        })
        .await;
    assert_invalid(result, "NewPieces: pieces should be ordered");
}

#[tokio::test]
async fn test_segment_not_found() {
    let metabase = test_metabase().await;
    let stream_id = Uuid::new_v4();
    let pieces = valid_pieces();
    // Known aliases for the old pieces must not change the outcome.
    metabase
        .aliases()
        .ensure_nodes(&[pieces[0].storage_node])
        .await
        .unwrap();

    for old_pieces in [pieces.clone(), valid_pieces()] {
        let err = metabase
            .update_segment_pieces(UpdateSegmentPieces {
                stream_id,
                position: SegmentPosition::new(0, 1),
                old_pieces,
                new_pieces: pieces.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MetabaseError::SegmentNotFound));
        assert_eq!(err.to_string(), "segment missing");
    }

    // A failed swap still leaves the new nodes with aliases.
    let fresh = valid_pieces();
    let err = metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position: SegmentPosition::new(0, 1),
            old_pieces: pieces.clone(),
            new_pieces: fresh.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::SegmentNotFound));
    assert!(
        metabase
            .aliases()
            .lookup_aliases(&[fresh[0].storage_node])
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_pieces_changed() {
    let metabase = test_metabase().await;
    let stream_id = Uuid::new_v4();
    create_object(&metabase, stream_id, 2).await;
    let position = SegmentPosition::new(0, 1);

    let before = metabase.get_segment_by_position(stream_id, position).await.unwrap();
    let raw_before = raw_pieces(&metabase, stream_id, position).await;

    // Same nodes, one piece dropped: well-formed but not what is stored.
    let stale = before.pieces[..2].to_vec();
    let err = metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position,
            old_pieces: stale,
            new_pieces: valid_pieces(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::ValueChanged));
    assert_eq!(err.to_string(), "segment pieces field was changed");

    // Nodes the alias table has never seen.
    let err = metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position,
            old_pieces: valid_pieces(),
            new_pieces: valid_pieces(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::ValueChanged));

    let after = metabase.get_segment_by_position(stream_id, position).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(raw_pieces(&metabase, stream_id, position).await, raw_before);
}

#[tokio::test]
async fn test_update_pieces() {
    let metabase = test_metabase().await;
    let stream_id = Uuid::new_v4();
    create_object(&metabase, stream_id, 2).await;
    let position = SegmentPosition::new(0, 1);

    let objects_before = metabase.object_count().await.unwrap();
    let object_before = sqlx::query_as::<_, (i32, i64, i32)>(
        "SELECT segment_count, total_encrypted_size, status FROM objects WHERE stream_id = ?",
    )
    .bind(stream_id)
    .fetch_one(&*metabase.db)
    .await
    .unwrap();
    let untouched = metabase
        .get_segment_by_position(stream_id, SegmentPosition::new(0, 0))
        .await
        .unwrap();
    let segment = metabase.get_segment_by_position(stream_id, position).await.unwrap();

    let expected_pieces = random_pieces(&[1, 2]);
    metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position,
            old_pieces: segment.pieces.clone(),
            new_pieces: expected_pieces.clone(),
        })
        .await
        .unwrap();

    let mut expected = segment.clone();
    expected.pieces = expected_pieces;
    let updated = metabase.get_segment_by_position(stream_id, position).await.unwrap();
    assert_eq!(updated, expected);

    assert_eq!(
        metabase
            .get_segment_by_position(stream_id, SegmentPosition::new(0, 0))
            .await
            .unwrap(),
        untouched
    );
    assert_eq!(metabase.object_count().await.unwrap(), objects_before);
    let object_after = sqlx::query_as::<_, (i32, i64, i32)>(
        "SELECT segment_count, total_encrypted_size, status FROM objects WHERE stream_id = ?",
    )
    .bind(stream_id)
    .fetch_one(&*metabase.db)
    .await
    .unwrap();
    assert_eq!(object_after, object_before);

    // The observed state is gone, so replaying the same swap loses.
    let err = metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position,
            old_pieces: segment.pieces,
            new_pieces: valid_pieces(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MetabaseError::ValueChanged));
}

#[tokio::test]
async fn test_concurrent_writers_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("metabase.db").display());
    let metabase = Metabase::connect(&url, 4).await.unwrap();
    metabase.migrate_schema().await.unwrap();

    let stream_id = Uuid::new_v4();
    create_object(&metabase, stream_id, 1).await;
    let position = SegmentPosition::new(0, 0);
    let observed = metabase.get_segment_by_position(stream_id, position).await.unwrap();

    let proposals: Vec<Pieces> = (0..8).map(|_| random_pieces(&[0, 1, 2])).collect();
    let results = join_all(proposals.iter().map(|new_pieces| {
        metabase.update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position,
            old_pieces: observed.pieces.clone(),
            new_pieces: new_pieces.clone(),
        })
    }))
    .await;

    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, result)| result.is_ok())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, MetabaseError::ValueChanged), "{:?}", err);
        }
    }

    let stored = metabase.get_segment_by_position(stream_id, position).await.unwrap();
    assert_eq!(stored.pieces, proposals[winners[0]]);

    // A loser re-reads and retries with the fresh state.
    let retry = random_pieces(&[4]);
    metabase
        .update_segment_pieces(UpdateSegmentPieces {
            stream_id,
            position,
            old_pieces: stored.pieces,
            new_pieces: retry.clone(),
        })
        .await
        .unwrap();
    let stored = metabase.get_segment_by_position(stream_id, position).await.unwrap();
    assert_eq!(stored.pieces, retry);
}
