// tests/channel_sqlite.rs
use std::path::Path;
use std::time::Duration;

use keyword_notifier::channel::{
    partition_for, ChannelConsumer, ChannelProducer, SqliteLog, StartOffset,
};
use keyword_notifier::error::ChannelError;

const WAIT: Duration = Duration::from_millis(50);

async fn open(dir: &Path, partitions: usize) -> SqliteLog {
    SqliteLog::open(&dir.join("channel.db"), partitions)
        .await
        .unwrap()
}

#[tokio::test]
async fn records_and_offsets_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = open(dir.path(), 1).await;
        for i in 0..3 {
            log.send("notifications", "user_1", format!("m{i}").into_bytes())
                .await
                .unwrap();
        }
        let mut c = log
            .consumer("g", "notifications", 0, 1, StartOffset::Earliest)
            .await
            .unwrap();
        let batch = c.poll(2, WAIT).await.unwrap();
        assert_eq!(batch.len(), 2);
        c.commit(&batch).await.unwrap();
        log.close().await;
    }

    let log = open(dir.path(), 1).await;
    assert_eq!(log.end_offset("notifications", 0).await.unwrap(), 3);
    assert_eq!(log.committed("g", "notifications", 0).await.unwrap(), Some(2));
    assert_eq!(log.lag("g", "notifications").await.unwrap(), 1);

    let mut c = log
        .consumer("g", "notifications", 0, 1, StartOffset::Earliest)
        .await
        .unwrap();
    let batch = c.poll(10, WAIT).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload, b"m2".to_vec());
    assert_eq!(batch[0].offset, 2);
    assert_eq!(batch[0].key, "user_1");
}

#[tokio::test]
async fn same_key_keeps_its_partition_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = open(dir.path(), 8).await;
    let a = log.send("t", "user_7", b"1".to_vec()).await.unwrap();
    let b = log.send("t", "user_7", b"2".to_vec()).await.unwrap();

    assert_eq!(a.partition, partition_for("user_7", 8));
    assert_eq!(b.partition, a.partition);
    assert_eq!(b.offset, a.offset + 1);

    let payloads: Vec<Vec<u8>> = log
        .read_topic("t")
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.payload)
        .collect();
    assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
}

#[tokio::test]
async fn reopening_with_other_partition_count_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = open(dir.path(), 4).await;
        log.send("t", "k", b"x".to_vec()).await.unwrap();
        log.close().await;
    }
    let err = SqliteLog::open(&dir.path().join("channel.db"), 2)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Layout(_)));
}

#[tokio::test]
async fn commit_trims_what_every_group_has_seen() {
    let dir = tempfile::tempdir().unwrap();
    let log = open(dir.path(), 1).await;
    let mut a = log.consumer("a", "t", 0, 1, StartOffset::Earliest).await.unwrap();
    let mut b = log.consumer("b", "t", 0, 1, StartOffset::Earliest).await.unwrap();
    for i in 0..5u8 {
        log.send("t", "k", vec![i; 1024]).await.unwrap();
    }

    let all = a.poll(10, WAIT).await.unwrap();
    a.commit(&all).await.unwrap();
    assert_eq!(log.retained("t", 0).await.unwrap(), 5);

    let all = b.poll(10, WAIT).await.unwrap();
    b.commit(&all).await.unwrap();
    assert_eq!(log.retained("t", 0).await.unwrap(), 0);
    assert_eq!(log.lag("a", "t").await.unwrap(), 0);

    // sequence numbers keep counting after the trim
    let pos = log.send("t", "k", b"late".to_vec()).await.unwrap();
    assert_eq!(pos.offset, 5);
    assert_eq!(log.lag("b", "t").await.unwrap(), 1);
}

#[tokio::test]
async fn poll_wakes_up_on_append() {
    let dir = tempfile::tempdir().unwrap();
    let log = open(dir.path(), 1).await;
    let mut c = log.consumer("g", "t", 0, 1, StartOffset::Latest).await.unwrap();

    let producer = log.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.send("t", "k", b"late".to_vec()).await.unwrap();
    });

    let batch = c.poll(10, Duration::from_secs(5)).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload, b"late".to_vec());
}

#[tokio::test]
async fn seek_and_foreign_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let log = open(dir.path(), 2).await;
    for i in 0..3u8 {
        log.send("t", "user_1", vec![i]).await.unwrap();
    }
    let p = partition_for("user_1", 2);
    let mut c = log.consumer("g", "t", p, 2, StartOffset::Earliest).await.unwrap();
    assert_eq!(c.assigned(), &[p]);
    assert_eq!(c.poll(10, WAIT).await.unwrap().len(), 3);

    c.seek(p, 1).unwrap();
    let again = c.poll(10, WAIT).await.unwrap();
    assert_eq!(again.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
    assert!(matches!(c.seek(1 - p, 0), Err(ChannelError::UnknownPartition(_))));
}

#[tokio::test]
async fn closed_log_refuses_sends_and_polls() {
    let dir = tempfile::tempdir().unwrap();
    let log = open(dir.path(), 1).await;
    let mut c = log.consumer("g", "t", 0, 1, StartOffset::Earliest).await.unwrap();
    log.close().await;

    assert!(matches!(
        log.send("t", "k", Vec::new()).await,
        Err(ChannelError::Closed)
    ));
    assert!(matches!(c.poll(1, WAIT).await, Err(ChannelError::Closed)));
}
