//! Streaming reads: chunk boundaries, small files, and 1-of-N fanouts.

mod common;

use anyhow::Result;
use common::{pattern_bytes, upload_file, upload_small_file, SimNet};
use std::sync::Arc;
use stratus::hash::SECTOR_SIZE;
use stratus::transport::{ContractSource, HostDialer};
use stratus::{Client, ClientConfig};

fn client_for(net: &Arc<SimNet>) -> Client {
    Client::new(
        Arc::clone(net) as Arc<dyn HostDialer>,
        Arc::clone(net) as Arc<dyn ContractSource>,
        ClientConfig::default(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_across_chunk_boundaries() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(3);
    // Two data pieces per chunk: the chunk size is 8 MiB, so 9 MiB of data
    // spans two chunks.
    let chunk_size = 2 * SECTOR_SIZE;
    let data = pattern_bytes((chunk_size + (1 << 20)) as usize, 1234);
    let link = upload_file(&hosts, &data, 2, 1, "spanning.bin");

    let client = client_for(&net);
    let source = client.open(link).await?;
    assert_eq!(source.filesize(), data.len() as u64);

    // A range straddling the chunk boundary.
    let straddle_start = (chunk_size - 1000) as usize;
    let mut buf = vec![0u8; 2000];
    let n = source.read_at(&mut buf, straddle_start as u64).await?;
    assert_eq!(n, 2000);
    assert_eq!(buf, data[straddle_start..straddle_start + 2000].to_vec());

    // A range starting exactly on the boundary.
    let mut buf = vec![0u8; 4096];
    let n = source.read_at(&mut buf, chunk_size).await?;
    assert_eq!(n, 4096);
    assert_eq!(buf, data[chunk_size as usize..chunk_size as usize + 4096].to_vec());

    // A read running past end of file comes back short.
    let tail_start = data.len() as u64 - 500;
    let mut buf = vec![0u8; 1000];
    let n = source.read_at(&mut buf, tail_start).await?;
    assert_eq!(n, 500);
    assert_eq!(buf[..500], data[data.len() - 500..]);

    // Reading at end of file yields nothing.
    let n = source.read_at(&mut buf, data.len() as u64).await?;
    assert_eq!(n, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn whole_file_reassembles() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(4);
    let chunk_size = (2 * SECTOR_SIZE) as usize;
    let data = pattern_bytes(chunk_size + 123_457, 77);
    let link = upload_file(&hosts, &data, 2, 2, "whole.bin");

    let client = client_for(&net);
    let source = client.open(link).await?;

    let mut buf = vec![0u8; data.len()];
    let n = source.read_at(&mut buf, 0).await?;
    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn small_file_is_served_from_the_base_sector() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(3);
    let data = pattern_bytes(2000, 8);
    let link = upload_small_file(&hosts, &data, "note.txt");

    let client = client_for(&net);
    let source = client.open(link).await?;
    let base_reads = net.total_read_requests();
    assert_eq!(source.metadata().filename, "note.txt");
    assert_eq!(source.filesize(), 2000);

    let mut buf = vec![0u8; 2000];
    assert_eq!(source.read_at(&mut buf, 0).await?, 2000);
    assert_eq!(buf, data);

    // Interior and tail reads.
    let mut buf = vec![0u8; 100];
    assert_eq!(source.read_at(&mut buf, 500).await?, 100);
    assert_eq!(buf, data[500..600].to_vec());
    assert_eq!(source.read_at(&mut buf, 2000).await?, 0);

    // Nothing beyond the base sector download itself was fetched.
    assert_eq!(net.total_read_requests(), base_reads);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn one_of_n_fanout_uses_a_single_root() -> Result<()> {
    let net = SimNet::new();
    let hosts = net.add_hosts(5);
    let data = pattern_bytes(300 << 10, 21);
    let link = upload_file(&hosts, &data, 1, 4, "replicated.bin");

    let client = client_for(&net);
    let source = client.open(link).await?;
    assert_eq!(source.layout().fanout_data_pieces, 1);

    let mut buf = vec![0u8; data.len()];
    let n = source.read_at(&mut buf, 0).await?;
    assert_eq!(n, data.len());
    assert_eq!(buf, data);
    Ok(())
}
