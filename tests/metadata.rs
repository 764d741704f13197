//! Writes a metadata record and reads it back via the summary's metadata
//! indexes.

use std::io::Cursor;

use anyhow::Result;
use mcap::records::Metadata;

#[test]
fn round_trip() -> Result<()> {
    let metadata = Metadata {
        name: String::from("myMetadata"),
        metadata: [(String::from("foo"), String::from("bar"))].into(),
    };

    let mut buf = Vec::new();
    {
        let mut writer = mcap::Writer::new(Cursor::new(&mut buf))?;
        writer.write_metadata(&metadata)?;
        writer.finish()?;
    }

    let summary = mcap::Summary::read(&buf)?.expect("file should have a summary");
    assert_eq!(summary.metadata_indexes.len(), 1);
    assert_eq!(summary.metadata_indexes[0].name, "myMetadata");

    let stats = summary.stats.expect("summary should have statistics");
    assert_eq!(stats.metadata_count, 1);

    let read_back = mcap::read::metadata(&buf, &summary.metadata_indexes[0])?;
    assert_eq!(read_back, metadata);

    Ok(())
}

#[test]
fn multiple_metadata_records_each_get_an_index() -> Result<()> {
    let mut buf = Vec::new();
    {
        let mut writer = mcap::Writer::new(Cursor::new(&mut buf))?;
        for i in 0..3 {
            writer.write_metadata(&Metadata {
                name: format!("metadata-{i}"),
                metadata: Default::default(),
            })?;
        }
        writer.finish()?;
    }

    let summary = mcap::Summary::read(&buf)?.expect("file should have a summary");
    assert_eq!(summary.metadata_indexes.len(), 3);
    let mut names: Vec<_> = summary
        .metadata_indexes
        .iter()
        .map(|mi| mi.name.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["metadata-0", "metadata-1", "metadata-2"]);

    Ok(())
}
