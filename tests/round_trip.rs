//! Writes a small MCAP in memory and reads it back, checking that messages,
//! schemas and channels survive the trip unchanged.

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;

#[test]
fn smoke() -> Result<()> {
    let mut buf = Vec::new();
    {
        let mut writer = mcap::Writer::new(Cursor::new(&mut buf))?;

        let schema_id = writer.add_schema("Example", "c", &[4, 5, 6])?;
        let channel_id = writer.add_channel(
            schema_id,
            "example",
            "a",
            &[(String::from("foo"), String::from("bar"))].into(),
        )?;

        let schema = Arc::new(mcap::Schema {
            id: schema_id,
            name: String::from("Example"),
            encoding: String::from("c"),
            data: Cow::Borrowed(&[4, 5, 6]),
        });
        let channel = Arc::new(mcap::Channel {
            id: channel_id,
            schema: Some(schema),
            topic: String::from("example"),
            message_encoding: String::from("a"),
            metadata: [(String::from("foo"), String::from("bar"))].into(),
        });

        writer.write(&mcap::Message {
            channel,
            sequence: 10,
            log_time: 2,
            publish_time: 1,
            data: Cow::Borrowed(&[1, 2, 3]),
        })?;

        writer.finish()?;
    }

    let messages = mcap::MessageStream::new(&buf)?.collect::<mcap::McapResult<Vec<_>>>()?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sequence, 10);
    assert_eq!(messages[0].log_time, 2);
    assert_eq!(messages[0].publish_time, 1);
    assert_eq!(&*messages[0].data, &[1, 2, 3]);
    assert_eq!(messages[0].channel.topic, "example");
    assert_eq!(messages[0].channel.schema.as_ref().unwrap().name, "Example");

    let summary = mcap::Summary::read(&buf)?.expect("file should have a summary");
    let stats = summary.stats.expect("summary should have statistics");
    assert_eq!(stats.message_count, 1);
    assert_eq!(stats.schema_count, 1);
    assert_eq!(stats.channel_count, 1);
    assert_eq!(stats.message_start_time, 2);
    assert_eq!(stats.message_end_time, 2);

    Ok(())
}

#[test]
fn unchunked_round_trip_matches_chunked() -> Result<()> {
    fn write_messages(use_chunks: bool) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = mcap::WriteOptions::new()
            .use_chunks(use_chunks)
            .create(Cursor::new(&mut buf))?;

        let schema_id = writer.add_schema("Example", "c", &[1, 2, 3])?;
        let channel_id =
            writer.add_channel(schema_id, "topic", "raw", &Default::default())?;

        let schema = Arc::new(mcap::Schema {
            id: schema_id,
            name: String::from("Example"),
            encoding: String::from("c"),
            data: Cow::Borrowed(&[1, 2, 3]),
        });
        let channel = Arc::new(mcap::Channel {
            id: channel_id,
            schema: Some(schema),
            topic: String::from("topic"),
            message_encoding: String::from("raw"),
            metadata: Default::default(),
        });

        for i in 0..5u32 {
            writer.write(&mcap::Message {
                channel: channel.clone(),
                sequence: i,
                log_time: i as u64,
                publish_time: i as u64,
                data: Cow::Owned(vec![i as u8; 4]),
            })?;
        }
        writer.finish()?;
        Ok(buf)
    }

    let chunked = write_messages(true)?;
    let unchunked = write_messages(false)?;

    let chunked_messages = mcap::MessageStream::new(&chunked)?.collect::<mcap::McapResult<Vec<_>>>()?;
    let unchunked_messages =
        mcap::MessageStream::new(&unchunked)?.collect::<mcap::McapResult<Vec<_>>>()?;

    assert_eq!(chunked_messages, unchunked_messages);

    Ok(())
}
