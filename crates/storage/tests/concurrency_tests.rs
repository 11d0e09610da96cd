//! Concurrent access to the chunk scratch area.

use bytes::Bytes;
use courier_core::UploadId;
use courier_storage::{ChunkStore, FilesystemBackend, ObjectStore};
use futures::TryStreamExt;
use std::sync::Arc;

async fn chunk_store() -> (tempfile::TempDir, ChunkStore) {
    let dir = tempfile::tempdir().unwrap();
    let backend = FilesystemBackend::new(dir.path()).await.unwrap();
    (dir, ChunkStore::new(Arc::new(backend)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_chunk_writes_to_one_session() {
    let (_dir, store) = chunk_store().await;
    let id = UploadId::parse("parallel").unwrap();
    store.create_session(&id).await.unwrap();

    let handles: Vec<_> = (0..32u32)
        .map(|i| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let data = Bytes::from(vec![i as u8; 1024]);
                store.write_chunk(&id, i, data).await.unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    for i in 0..32u32 {
        let parts: Vec<Bytes> = store.open_chunk(&id, i).await.unwrap().try_collect().await.unwrap();
        let data = parts.concat();
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|b| *b == i as u8));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rewrites_leave_one_whole_chunk() {
    let (_dir, store) = chunk_store().await;
    let id = UploadId::parse("rewrite").unwrap();

    let handles: Vec<_> = (0..8u8)
        .map(|fill| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                store
                    .write_chunk(&id, 0, Bytes::from(vec![fill; 64 * 1024]))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let parts: Vec<Bytes> = store.open_chunk(&id, 0).await.unwrap().try_collect().await.unwrap();
    let data = parts.concat();
    assert_eq!(data.len(), 64 * 1024);
    assert!(data.iter().all(|b| *b == data[0]));
}

#[tokio::test]
async fn test_concurrent_staged_bodies_are_isolated() {
    let (_dir, store) = chunk_store().await;

    let (key_a, mut a) = store.stage().await.unwrap();
    let (key_b, mut b) = store.stage().await.unwrap();
    assert_ne!(key_a, key_b);

    a.write(Bytes::from_static(b"first")).await.unwrap();
    b.write(Bytes::from_static(b"second")).await.unwrap();
    a.write(Bytes::from_static(b"!")).await.unwrap();
    a.finish().await.unwrap();
    b.abort().await.unwrap();

    let parts: Vec<Bytes> = store.open_staged(&key_a).await.unwrap().try_collect().await.unwrap();
    assert_eq!(parts.concat(), b"first!");
    assert!(store.open_staged(&key_b).await.is_err());
}

#[tokio::test]
async fn test_remove_session_with_open_upload_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
    let store = ChunkStore::new(backend.clone());
    let id = UploadId::parse("gone").unwrap();
    store.write_chunk(&id, 0, Bytes::from_static(b"x")).await.unwrap();

    let mut upload = backend.put_stream("other/blob").await.unwrap();
    upload.write(Bytes::from_static(b"kept")).await.unwrap();
    store.remove_session(&id).await.unwrap();
    upload.finish().await.unwrap();

    assert!(backend.get("gone/0").await.unwrap_err().is_not_found());
    assert_eq!(backend.get("other/blob").await.unwrap(), "kept");
}
