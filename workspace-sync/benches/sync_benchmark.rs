use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;
use workspace_sync::broadcast::{Fanout, Member, Membership};
use workspace_sync::client::OfflineQueue;
use workspace_sync::session::Outbound;
use workspace_sync::storage::{MemoryStore, RocksStore, StoreConfig};
use workspace_sync::{
    AppFrame, ChatRoute, CrdtDocument, CrdtFrame, CrdtType, ExportMode, Identity, RoomId, RoomKey,
    RoomDocumentCache, SessionAttachment, Transport, WorkspaceBlobUri, WorkspaceStore,
};

fn room() -> RoomKey {
    RoomKey::new(RoomId::project("acme", "p1").unwrap(), CrdtType::Yrs)
}

fn document_with_edits(edits: usize) -> CrdtDocument {
    let doc = CrdtDocument::new();
    for i in 0..edits {
        doc.append_text("body", &format!("edit {i}; "));
    }
    doc
}

fn bench_frame_encode(c: &mut Criterion) {
    let key = room();
    let update = vec![0u8; 64];

    c.bench_function("frame_encode_64B", |b| {
        b.iter(|| {
            let frame = CrdtFrame::update(black_box(&key), black_box(update.clone()));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = CrdtFrame::update(&room(), vec![0u8; 64]).encode().unwrap();

    c.bench_function("frame_decode_64B", |b| {
        b.iter(|| {
            black_box(CrdtFrame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_app_frame_json(c: &mut Criterion) {
    let frame = AppFrame::NewMsg {
        message: serde_json::json!({"text": "standup in 5", "mentions": ["bob"]}),
    };

    c.bench_function("app_frame_to_json", |b| {
        b.iter(|| {
            black_box(frame.to_json().unwrap());
        })
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let route = ChatRoute::new("acme", "p1", "general").unwrap();
    let identity = Identity::new("user", ["acme"]);
    let mut members = Membership::new();
    let mut receivers = Vec::new();
    for _ in 0..100 {
        let attachment = SessionAttachment::new(Uuid::new_v4(), &identity, &route, route.path(), None);
        let (transport, rx) = Transport::channel(1024);
        let mut member = Member::new(attachment, transport);
        member.joined.insert(room());
        members.insert(member);
        receivers.push(rx);
    }
    let payload = Arc::new(CrdtFrame::update(&room(), vec![0u8; 64]).encode().unwrap());

    c.bench_function("broadcast_room_100_members", |b| {
        b.iter(|| {
            let reached = members.broadcast_room(
                &room(),
                Outbound::Binary(payload.clone()),
                Fanout::Everyone,
            );
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            black_box(reached);
        })
    });
}

fn bench_export_update_since(c: &mut Criterion) {
    let doc = document_with_edits(1_000);
    let replica = CrdtDocument::import(&doc.export(ExportMode::Snapshot).unwrap()).unwrap();
    doc.append_text("body", "one more");
    let since = replica.frontiers();

    c.bench_function("export_update_since_1000_edits", |b| {
        b.iter(|| {
            black_box(doc.export(ExportMode::UpdateSince(black_box(&since))).unwrap());
        })
    });
}

fn bench_fork_1000_edits(c: &mut Criterion) {
    let doc = document_with_edits(1_000);

    c.bench_function("fork_1000_edits", |b| {
        b.iter(|| {
            black_box(doc.fork().unwrap());
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1_000u32 {
                queue.enqueue(room(), i.to_le_bytes().to_vec());
            }
            black_box(queue.drain());
        })
    });
}

fn bench_cache_flush(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(WorkspaceStore::from_backend(Arc::new(MemoryStore::new())));
    let mut cache = RoomDocumentCache::new(store);
    let editor = CrdtDocument::new();

    c.bench_function("cache_apply_and_flush", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let update = editor.append_text("body", "x");
                let document = cache.get_or_create(&room()).await.unwrap();
                document.apply_update(&update).unwrap();
                black_box(cache.flush(&room()).await.unwrap());
            })
        })
    });
}

fn bench_rocks_save_blob(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let uri = WorkspaceBlobUri::for_project("acme", "p1");
    let blob = document_with_edits(200).export(ExportMode::Snapshot).unwrap();

    c.bench_function("rocks_save_blob", |b| {
        b.iter(|| {
            black_box(store.save_blob(&uri, black_box(&blob)).unwrap());
        })
    });
}

fn bench_rocks_load_blob(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let uri = WorkspaceBlobUri::for_project("acme", "p1");
    let blob = document_with_edits(200).export(ExportMode::Snapshot).unwrap();
    store.save_blob(&uri, &blob).unwrap();

    c.bench_function("rocks_load_blob", |b| {
        b.iter(|| {
            black_box(store.load_blob(black_box(&uri)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_app_frame_json,
    bench_broadcast_100_members,
    bench_export_update_since,
    bench_fork_1000_edits,
    bench_offline_queue,
    bench_cache_flush,
    bench_rocks_save_blob,
    bench_rocks_load_blob,
);
criterion_main!(benches);
