use std::sync::Arc;

use anyhow::Result;
use crdtcake_cluster::rpc::{
    Ack,
    CrdtServer,
    EntryBatch,
    RemoteCrdtStorage,
    RemoteNetwork,
    RemoteOptions,
    Upload,
};
use crdtcake_cluster::{load_scheme, ClusterCrdtStorage, ClusterError, ClusterOptions, ConfigSource, StaticDiscovery};
use crdtcake_crdt::{ignoring_timestamp, CrdtCodec, CrdtData, RkyvCodec};
use crdtcake_rpc::{Channel, ErrorCode, RpcMessage};
use crdtcake_storage::{test_suite, CrdtStorage, MapCrdtStorage, StorageError};
use futures::{stream, StreamExt, TryStreamExt};

mod utils;

use utils::{entry, numbered_entries, start_remote_partitions, union, Set, SetCodec};

#[tokio::test]
async fn test_remote_storage_contract() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = test_helper::get_unused_addr();
    let storage = MapCrdtStorage::new(union());
    let server = CrdtServer::listen(
        addr,
        Arc::new(storage) as Arc<dyn CrdtStorage<String, Set>>,
        Arc::new(SetCodec) as Arc<dyn CrdtCodec<String, Set>>,
    )
    .await?;

    let client = RemoteCrdtStorage::<String, Set>::new(
        server.local_addr(),
        Arc::new(SetCodec),
        RemoteOptions::default().with_batch_size(1),
    );
    test_suite::run_test_suite(client).await;

    Ok(())
}

#[tokio::test]
async fn test_remote_storage_unavailable() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let client = RemoteCrdtStorage::<String, Set>::new(
        test_helper::get_unused_addr(),
        Arc::new(SetCodec),
        RemoteOptions::default(),
    );

    let err = client.ping().await.expect_err("Nothing is listening on the address");
    assert!(matches!(err, StorageError::Unavailable(_)), "Got {:?}", err);

    Ok(())
}

#[tokio::test]
async fn test_corrupt_batch_discards_upload() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let storage = Arc::new(MapCrdtStorage::new(union()));
    let server = CrdtServer::listen(
        test_helper::get_unused_addr(),
        storage.clone() as Arc<dyn CrdtStorage<String, Set>>,
        Arc::new(SetCodec) as Arc<dyn CrdtCodec<String, Set>>,
    )
    .await?;

    let mut channel = Channel::connect(server.local_addr()).await?;
    channel.send(&Upload).await?;
    channel
        .send(&EntryBatch {
            entries: vec![SetCodec.encode(&entry("a", 1, [1]))?],
        })
        .await?;
    channel.send_frame(EntryBatch::KIND, &[1, 2, 3]).await?;

    let status = channel
        .recv::<Ack>()
        .await
        .expect_err("A corrupt batch must fail the upload");
    assert_eq!(status.code, ErrorCode::MalformedPayload);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(storage.is_empty(), "Entries before the corrupt batch must not be applied.");

    Ok(())
}

#[tokio::test]
async fn test_remote_rkyv_codec() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let concat = || {
        ignoring_timestamp(|mut a: Vec<u32>, b: Vec<u32>| {
            a.extend(b);
            a.sort_unstable();
            a.dedup();
            a
        })
    };

    let storage = MapCrdtStorage::<String, Vec<u32>>::new(concat());
    let server = CrdtServer::listen(
        test_helper::get_unused_addr(),
        Arc::new(storage) as Arc<dyn CrdtStorage<String, Vec<u32>>>,
        Arc::new(RkyvCodec::<String, Vec<u32>>::new()) as Arc<dyn CrdtCodec<String, Vec<u32>>>,
    )
    .await?;

    let client = RemoteCrdtStorage::<String, Vec<u32>>::new(
        server.local_addr(),
        Arc::new(RkyvCodec::<String, Vec<u32>>::new()),
        RemoteOptions::default(),
    );

    let upload = |values: Vec<u32>| {
        stream::iter(vec![Ok(CrdtData::new("key".to_string(), 1, values))]).boxed()
    };
    client.upload(upload(vec![3, 1])).await?;
    client.upload(upload(vec![2, 3])).await?;

    let entries = client.download(0).await?.try_collect::<Vec<_>>().await?;
    assert_eq!(entries, vec![CrdtData::new("key".to_string(), 1, vec![1, 2, 3])]);

    Ok(())
}

#[tokio::test]
async fn test_cluster_from_config() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let partitions = start_remote_partitions(3).await?;
    let ids = partitions
        .iter()
        .map(|partition| partition.id.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let config = format!(
        "
        # Every key is written to 2 of the 3 partitions.
        partitionGroup.g.ids = {}
        partitionGroup.g.replicas = 2
        partitionGroup.g.repartition = true
        ",
        ids,
    );
    let source = ConfigSource::parse(&config)?;
    let network = Arc::new(RemoteNetwork::new(SetCodec, RemoteOptions::default()));
    let scheme = load_scheme(&source, network)?;
    assert_eq!(scheme.groups()[0].replicas(), 2);

    let cluster =
        ClusterCrdtStorage::start(StaticDiscovery::new(scheme), union(), ClusterOptions::default())
            .await?;
    cluster.ping().await?;

    cluster.upload(numbered_entries(2_000)).await?;
    let entries = cluster.download(0).await?.try_collect::<Vec<_>>().await?;
    assert_eq!(entries.len(), 2_000);

    let mut stored = 0;
    for partition in partitions.iter() {
        stored += partition.storage.download(0).await?.count().await;
    }
    assert_eq!(stored, 4_000, "Every key should be stored on 2 partitions.");

    let taken = cluster.take().await?.collect_and_commit().await?;
    assert_eq!(taken.len(), 2_000);
    assert_eq!(cluster.download(0).await?.count().await, 0);

    partitions[0].server.shutdown();
    let err = cluster.ping().await.expect_err("Ping should fail with a dead partition");
    assert!(matches!(err, ClusterError::PingFailed(_)), "Got {:?}", err);
    assert_eq!(cluster.dead_partitions(), vec![partitions[0].id.clone()]);

    Ok(())
}

#[test]
fn test_malformed_config() {
    let source = ConfigSource::parse("partitionGroup.g.ids = g|a|not-an-addr").expect("Parse config");
    let network = RemoteNetwork::<String, Set>::new(SetCodec, RemoteOptions::default());
    let err = load_scheme(&source, network).expect_err("Malformed address should be rejected");

    let err = ClusterError::from(err);
    assert!(err.to_string().starts_with("Malformed configuration"));
}
