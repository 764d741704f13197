//! Checks the chunking and per-channel message-index behavior described in
//! spec scenario 2: a small chunk size forces multiple chunks, and each
//! chunk gets exactly one MessageIndex per channel with at least one
//! message in it.

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;

#[test]
fn small_chunk_size_produces_multiple_chunks_with_one_index_per_channel() -> Result<()> {
    let mut buf = Vec::new();
    {
        let mut writer = mcap::WriteOptions::new()
            .compression(None)
            .chunk_size(Some(200))
            .create(Cursor::new(&mut buf))?;

        let channel1 = Arc::new(mcap::Channel {
            id: 0,
            schema: None,
            topic: String::from("ch1"),
            message_encoding: String::from("raw"),
            metadata: Default::default(),
        });
        let channel2 = Arc::new(mcap::Channel {
            id: 1,
            schema: None,
            topic: String::from("ch2"),
            message_encoding: String::from("raw"),
            metadata: Default::default(),
        });

        writer.write(&mcap::Message {
            channel: channel1,
            sequence: 0,
            log_time: 100,
            publish_time: 100,
            data: Cow::Owned(vec![0u8; 20]),
        })?;
        writer.write(&mcap::Message {
            channel: channel2,
            sequence: 0,
            log_time: 200,
            publish_time: 200,
            data: Cow::Owned(vec![0u8; 400]),
        })?;

        writer.finish()?;
    }

    let summary = mcap::Summary::read(&buf)?.expect("file should have a summary");
    assert_eq!(summary.chunk_indexes.len(), 2);

    for chunk_index in &summary.chunk_indexes {
        assert_eq!(chunk_index.message_index_offsets.len(), 1);
        let indexes = summary.read_message_indexes(&buf, chunk_index)?;
        assert_eq!(indexes.len(), 1);
        for records in indexes.values() {
            assert_eq!(records.len(), 1);
        }
    }

    Ok(())
}

#[test]
fn flush_cuts_a_chunk_without_changing_message_order() -> Result<()> {
    let channel = Arc::new(mcap::Channel {
        id: 0,
        schema: None,
        topic: String::from("topic"),
        message_encoding: String::from("raw"),
        metadata: Default::default(),
    });

    let mut buf = Vec::new();
    {
        let mut writer = mcap::Writer::new(Cursor::new(&mut buf))?;
        for i in 0..10u32 {
            writer.write(&mcap::Message {
                channel: channel.clone(),
                sequence: i,
                log_time: i as u64,
                publish_time: i as u64,
                data: Cow::Owned(vec![i as u8]),
            })?;
            if i % 2 == 0 {
                writer.flush()?;
            }
        }
        writer.finish()?;
    }

    let summary = mcap::Summary::read(&buf)?.expect("file should have a summary");
    assert!(summary.chunk_indexes.len() > 1);

    let messages = mcap::MessageStream::new(&buf)?.collect::<mcap::McapResult<Vec<_>>>()?;
    let sequences: Vec<_> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, (0..10).collect::<Vec<_>>());

    Ok(())
}
