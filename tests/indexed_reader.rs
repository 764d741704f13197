//! Drives `sans_io::IndexedReader` over an in-memory MCAP to check that
//! messages come out in log-time order (forward and reverse) even when
//! chunks were written out of log-time order, and that ties break by
//! file-storage order.

use std::io::{Cursor, Read, Seek};

use anyhow::Result;
use mcap::sans_io::{IndexedReadEvent, IndexedReader, IndexedReaderOptions, ReadOrder};

fn write_mcap(chunk_size: u64, messages: &[(u32, u64)]) -> Result<Vec<u8>> {
    use std::borrow::Cow;
    use std::sync::Arc;

    let mut buf = Vec::new();
    let mut writer = mcap::WriteOptions::new()
        .chunk_size(Some(chunk_size))
        .create(Cursor::new(&mut buf))?;

    let channel = Arc::new(mcap::Channel {
        id: 0,
        schema: None,
        topic: String::from("topic"),
        message_encoding: String::from("raw"),
        metadata: Default::default(),
    });

    for &(sequence, log_time) in messages {
        writer.write(&mcap::Message {
            channel: channel.clone(),
            sequence,
            log_time,
            publish_time: log_time,
            data: Cow::Owned(vec![0u8; 1024]),
        })?;
    }
    writer.finish()?;
    Ok(buf)
}

/// Drains an `IndexedReader` over an in-memory buffer, returning the
/// sequence numbers of every message it yields, in the order yielded.
fn drain(buf: &[u8], options: IndexedReaderOptions) -> Result<Vec<u32>> {
    let summary = mcap::Summary::read(buf)?.expect("file should have a summary");
    let mut cursor = Cursor::new(buf);
    let mut reader = IndexedReader::new_with_options(&summary, options)?;

    let mut sequences = Vec::new();
    while let Some(event) = reader.next_event() {
        match event? {
            IndexedReadEvent::ReadRequest(need) => {
                let read = cursor.read(reader.insert(need))?;
                reader.notify_read(read);
            }
            IndexedReadEvent::SeekRequest(to) => {
                let pos = cursor.seek(to)?;
                reader.notify_seeked(pos);
            }
            IndexedReadEvent::Message { header, .. } => {
                sequences.push(header.sequence);
            }
        }
    }
    Ok(sequences)
}

#[test]
fn out_of_order_chunks_sort_by_log_time() -> Result<()> {
    // Three ~1 KiB messages, written sequence order 0,2,1 with log_times 0,2,1 and a
    // chunk size small enough that each message lands in its own chunk.
    let buf = write_mcap(512, &[(0, 0), (2, 2), (1, 1)])?;

    let forward = drain(buf.as_slice(), IndexedReaderOptions::new())?;
    assert_eq!(forward, vec![0, 1, 2]);

    let reverse = drain(
        buf.as_slice(),
        IndexedReaderOptions::new().with_order(ReadOrder::ReverseLogTime),
    )?;
    assert_eq!(reverse, vec![2, 1, 0]);

    Ok(())
}

#[test]
fn ties_break_by_file_order_and_reverse_by_reverse_file_order() -> Result<()> {
    // Seven messages, sequence == write order, log_times [100,100,100,300,300,300,200],
    // all packed into one chunk.
    let log_times = [100, 100, 100, 300, 300, 300, 200];
    let messages: Vec<(u32, u64)> = log_times
        .iter()
        .enumerate()
        .map(|(i, &t)| (i as u32, t))
        .collect();
    let buf = write_mcap(1024 * 1024, &messages)?;

    let forward = drain(buf.as_slice(), IndexedReaderOptions::new())?;
    assert_eq!(forward, vec![0, 1, 2, 6, 3, 4, 5]);

    let reverse = drain(
        buf.as_slice(),
        IndexedReaderOptions::new().with_order(ReadOrder::ReverseLogTime),
    )?;
    assert_eq!(reverse, vec![5, 4, 3, 6, 2, 1, 0]);

    Ok(())
}

#[test]
fn time_range_filter_is_sound() -> Result<()> {
    let messages: Vec<(u32, u64)> = (0..10).map(|i| (i, i as u64 * 10)).collect();
    let buf = write_mcap(64, &messages)?;

    let windowed = drain(
        buf.as_slice(),
        IndexedReaderOptions::new()
            .log_time_on_or_after(20)
            .log_time_before(60),
    )?;
    // log_times 20, 30, 40, 50 -> sequences 2, 3, 4, 5
    assert_eq!(windowed, vec![2, 3, 4, 5]);

    Ok(())
}

#[test]
fn byte_range_spans_overlapping_chunks_only() -> Result<()> {
    // One message per chunk (small chunk size forces a chunk boundary on every write), with
    // log_times 0, 10, 20, ..., 90.
    let messages: Vec<(u32, u64)> = (0..10).map(|i| (i, i as u64 * 10)).collect();
    let buf = write_mcap(64, &messages)?;

    let summary = mcap::Summary::read(&buf)?.expect("file should have a summary");
    assert_eq!(summary.chunk_indexes.len(), 10, "expected one chunk per message");

    let (start, end) = summary
        .byte_range(20, 41)
        .expect("window should overlap some chunks");

    // The byte range should span exactly the chunks covering log_times 20, 30, 40.
    let covering: Vec<_> = summary
        .chunk_indexes
        .iter()
        .filter(|ci| ci.message_end_time >= 20 && ci.message_start_time < 41)
        .collect();
    assert_eq!(covering.len(), 3);
    let expected_start = covering
        .iter()
        .map(|ci| ci.chunk_start_offset)
        .min()
        .unwrap();
    let expected_end = covering
        .iter()
        .map(|ci| ci.chunk_start_offset + ci.chunk_length)
        .max()
        .unwrap();
    assert_eq!((start, end), (expected_start, expected_end));

    // A window entirely past the last message overlaps nothing.
    assert_eq!(summary.byte_range(1000, 2000), None);

    Ok(())
}
