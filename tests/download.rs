//! End-to-end download scenarios against the simulated host network.

mod common;

use anyhow::Result;
use common::{pattern_bytes, publish_base, upload_file, SimNet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratus::download::DownloadError;
use stratus::erasure::{ErasureCoder, RsSubCode};
use stratus::hash::Hash;
use stratus::link::{Link, LinkError, LINK_SIZE};
use stratus::merkle::sector_root;
use stratus::transport::{ContractSource, HostDialer};
use stratus::{Client, ClientConfig, Error};

fn client_for(net: &Arc<SimNet>) -> Client {
    Client::new(
        Arc::clone(net) as Arc<dyn HostDialer>,
        Arc::clone(net) as Arc<dyn ContractSource>,
        ClientConfig::default(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_ten_of_thirty() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(30);
    let data = pattern_bytes(1 << 20, 42);
    let link = upload_file(&hosts, &data, 10, 20, "movie.mkv");

    let client = client_for(&net);
    let source = client.open(link).await?;
    assert_eq!(source.filesize(), data.len() as u64);
    assert_eq!(source.metadata().filename, "movie.mkv");

    let mut buf = vec![0u8; data.len()];
    let n = source.read_at(&mut buf, 0).await?;
    assert_eq!(n, data.len());
    assert_eq!(buf, data);

    // One read for the base sector, ten for the chunk. With every host
    // answering instantly, overdrive never fires.
    assert_eq!(net.total_read_requests(), 11);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_host_triggers_overdrive() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(30);
    let data = pattern_bytes(1 << 20, 7);
    let link = upload_file(&hosts, &data, 10, 20, "slow.bin");

    let client = client_for(&net);
    let source = client.open(link).await?;
    // Let every probe resolve so the selected complement is deterministic.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Every host in the initially selected complement is fast except one,
    // which blows far past the fresh-tracker estimate.
    hosts[25].set_read_latency(Duration::from_millis(500));

    let started = Instant::now();
    let mut buf = vec![0u8; data.len()];
    let n = source.read_at(&mut buf, 0).await?;
    let elapsed = started.elapsed();

    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    // The decode used the first ten pieces to return; the slow host was not
    // waited out.
    assert!(
        elapsed < Duration::from_millis(450),
        "download waited for the slow host: {elapsed:?}"
    );
    // Base read + ten initial launches + one overdrive launch.
    assert_eq!(net.total_read_requests(), 12);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_piece_falls_back_to_second_holder() -> Result<()> {
    let net = SimNet::new();
    let h0 = net.add_host(1);
    let h1 = net.add_host(2);
    let h2 = net.add_host(3);

    // Two data pieces, one parity. Piece 0 lives on h0; piece 1 lives on
    // both h1 (which will serve corrupt bytes) and h2 (healthy, but slow to
    // answer its probe). The parity piece is hosted nowhere.
    let data = pattern_bytes(256 << 10, 99);
    let coder = RsSubCode::new(2, 1)?;
    let pieces = coder.encode(&data)?;
    let roots: Vec<Hash> = pieces.iter().map(|p| sector_root(p)).collect();
    h0.store(roots[0], pieces[0].clone());
    h1.store(roots[1], pieces[1].clone());
    h2.store(roots[1], pieces[1].clone());
    h1.set_corrupt_reads(true);
    h2.set_probe_latency(Duration::from_millis(150));

    let link = publish_base(&[Arc::clone(&h0)], &[roots.clone()], data.len() as u64, 2, 1, "f");
    let client = client_for(&net);
    let source = client.open(link).await?;

    let mut buf = vec![0u8; data.len()];
    let n = source.read_at(&mut buf, 0).await?;
    assert_eq!(n, data.len());
    assert_eq!(buf, data);

    // h1's proof mismatch marked its attempt failed; h2 was then selected
    // for the same piece and completed it.
    assert_eq!(h1.read_requests(), 1);
    assert_eq!(h2.read_requests(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_emits_one_terminal_error_quickly() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(4);
    let data = pattern_bytes(256 << 10, 3);
    let link = upload_file(&hosts, &data, 2, 2, "c");

    let client = client_for(&net);
    let source = Arc::new(client.open(link).await?);

    // All reads now hang far longer than the test is willing to wait.
    for host in &hosts {
        host.set_read_latency(Duration::from_secs(30));
    }

    let reader = {
        let source = Arc::clone(&source);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let started = Instant::now();
            let result = source.read_at(&mut buf, 0).await;
            (result, started.elapsed())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    source.close();
    source.close(); // idempotent

    let (result, elapsed) = reader.await?;
    match result {
        Err(Error::Download(DownloadError::Cancelled)) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(
        elapsed < Duration::from_secs(2),
        "cancellation took {elapsed:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_link_rejected_before_any_network_traffic() -> Result<()> {
    let net = SimNet::new();
    net.add_hosts(5);
    let client = client_for(&net);

    // Largest alignment class with both indices maxed decodes to a region
    // past the sector boundary.
    let mut bitfield: u16 = 0;
    bitfield |= 0x7F << 2;
    bitfield |= 0b111 << 10;
    bitfield |= 0b111 << 13;
    let mut bytes = [0u8; LINK_SIZE];
    bytes[..2].copy_from_slice(&bitfield.to_le_bytes());
    bytes[2..].copy_from_slice(stratus::hash::leaf_hash(b"x").as_bytes());
    let link = Link::from_bytes(&bytes)?;

    match client.open(link).await {
        Err(Error::Link(LinkError::Malformed)) => {}
        other => panic!("expected malformed link, got {other:?}"),
    }
    assert_eq!(net.total_requests(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn contract_removal_falls_back_to_remaining_hosts() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(3);
    let data = pattern_bytes(200 << 10, 11);
    let link = upload_file(&hosts, &data, 2, 1, "churn.bin");

    let client = client_for(&net);
    let source = client.open(link).await?;
    // Let the chunk probes resolve while all three hosts still exist.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The host holding piece 0 loses its contract; its worker is killed.
    net.remove_host(hosts[0].key);
    client.update_workers();

    // The remaining data and parity pieces still decode the chunk.
    let mut buf = vec![0u8; data.len()];
    let n = source.read_at(&mut buf, 0).await?;
    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unhosted_pieces_fail_with_insufficient_workers() -> Result<()> {
    let net = SimNet::new();
    let h0 = net.add_host(1);
    net.add_host(2);

    // The fanout names three pieces but only piece 0 exists anywhere.
    let data = pattern_bytes(128 << 10, 5);
    let coder = RsSubCode::new(2, 1)?;
    let pieces = coder.encode(&data)?;
    let roots: Vec<Hash> = pieces.iter().map(|p| sector_root(p)).collect();
    h0.store(roots[0], pieces[0].clone());

    let link = publish_base(&[h0], &[roots], data.len() as u64, 2, 1, "missing");
    let client = client_for(&net);
    let source = client.open(link).await?;

    let mut buf = vec![0u8; 1024];
    match source.read_at(&mut buf, 0).await {
        Err(Error::Download(DownloadError::InsufficientWorkers)) => {}
        other => panic!("expected insufficient workers, got {other:?}"),
    }
    Ok(())
}
