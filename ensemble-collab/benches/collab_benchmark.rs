use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ensemble_collab::presence::{AwarenessMessage, Vec2};
use ensemble_collab::protocol::SyncMessage;
use ensemble_core::{FormationDoc, Op, PerformerRecord, Position, StampedOp};
use uuid::Uuid;

fn performer_op(doc: &mut FormationDoc) -> StampedOp {
    doc.apply_local(Op::AddPerformer {
        id: Uuid::new_v4(),
        record: PerformerRecord {
            name: "Ada".into(),
            label: "P1".into(),
            color: "#a3c94e".into(),
        },
    })
    .delta
}

fn bench_delta_encode(c: &mut Criterion) {
    let client = Uuid::new_v4();
    let doc_id = Uuid::new_v4();
    let mut doc = FormationDoc::new(client);
    let ops = vec![performer_op(&mut doc)];

    c.bench_function("delta_encode_one_op", |b| {
        b.iter(|| {
            let msg =
                SyncMessage::delta(black_box(client), black_box(doc_id), black_box(1), &ops)
                    .unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let client = Uuid::new_v4();
    let mut doc = FormationDoc::new(client);
    let ops = vec![performer_op(&mut doc)];
    let msg = SyncMessage::delta(client, Uuid::new_v4(), 1, &ops).unwrap();
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_one_op", |b| {
        b.iter(|| {
            let decoded = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(decoded.ops().unwrap());
        })
    });
}

fn bench_local_apply(c: &mut Criterion) {
    let kf = Uuid::new_v4();
    let performer = Uuid::new_v4();

    c.bench_function("doc_apply_local_position", |b| {
        let mut doc = FormationDoc::new(Uuid::new_v4());
        doc.apply_local(Op::AddKeyframe {
            id: kf,
            timestamp_ms: 0,
        });
        let mut x = 0.0f32;
        b.iter(|| {
            x += 1.0;
            black_box(doc.apply_local(Op::UpdatePosition {
                keyframe_id: kf,
                performer_id: performer,
                position: Some(Position::new(x, x)),
            }));
        })
    });
}

fn bench_remote_merge_1k(c: &mut Criterion) {
    // 1000 position updates authored by one replica, merged by another.
    let mut author = FormationDoc::new(Uuid::new_v4());
    let kf = Uuid::new_v4();
    author.apply_local(Op::AddKeyframe {
        id: kf,
        timestamp_ms: 0,
    });
    let deltas: Vec<StampedOp> = (0..1000)
        .map(|i| {
            author
                .apply_local(Op::UpdatePosition {
                    keyframe_id: kf,
                    performer_id: Uuid::new_v4(),
                    position: Some(Position::new(i as f32, i as f32)),
                })
                .delta
        })
        .collect();

    c.bench_function("doc_merge_1k_ops", |b| {
        b.iter(|| {
            let mut replica = FormationDoc::new(Uuid::new_v4());
            black_box(replica.apply_remote(black_box(&deltas)));
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let msg = AwarenessMessage::Cursor {
        client_id: Uuid::new_v4(),
        position: Some(Vec2::new(100.0, 200.0)),
        timestamp: 1,
    };

    c.bench_function("cursor_encode", |b| {
        b.iter(|| {
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut doc = FormationDoc::new(Uuid::new_v4());
    let performers: Vec<Uuid> = (0..50)
        .map(|i| {
            let id = Uuid::new_v4();
            doc.apply_local(Op::AddPerformer {
                id,
                record: PerformerRecord {
                    name: format!("P{i}"),
                    label: format!("{i}"),
                    color: "#a3c94e".into(),
                },
            });
            id
        })
        .collect();
    for t in 0..20 {
        let kf = Uuid::new_v4();
        doc.apply_local(Op::AddKeyframe {
            id: kf,
            timestamp_ms: t * 500,
        });
        doc.apply_local(Op::UpdatePositions {
            keyframe_id: kf,
            positions: performers
                .iter()
                .map(|p| (*p, Some(Position::new(1.0, 2.0))))
                .collect(),
        });
    }

    c.bench_function("snapshot_50x20", |b| {
        b.iter(|| {
            black_box(doc.snapshot());
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_local_apply,
    bench_remote_merge_1k,
    bench_cursor_encode,
    bench_snapshot,
);
criterion_main!(benches);
