use crate::appraisal::SystemAppraisal;
use crate::simulation::{ColumnHeader, SimulationOutputs, SystemDetails};
use formatx::formatx;
use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use strum::IntoEnumIterator;

pub trait Output: Debug {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write>;
    /// Whether this output can be considered a no-op and therefore that any code that only writes to the output can be skipped.
    fn is_noop(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct FileOutput {
    directory_path: PathBuf,
    file_template: String,
}

impl FileOutput {
    pub fn new(directory_path: PathBuf, file_template: String) -> Self {
        Self {
            directory_path,
            file_template,
        }
    }
}

impl Output for FileOutput {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
        Ok(BufWriter::new(File::create(self.directory_path.join(
            formatx!(&self.file_template, location_key).unwrap(),
        ))?))
    }
}

impl Output for &FileOutput {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
        <FileOutput as Output>::writer_for_location_key(self, location_key)
    }
}

/// An output that goes to nowhere/ a "sink"/ /dev/null.
#[derive(Debug, Default)]
pub struct SinkOutput;

impl Output for SinkOutput {
    fn writer_for_location_key(&self, _location_key: &str) -> anyhow::Result<impl Write> {
        Ok(io::sink())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Write the hourly result table as CSV, one row per hour, columns in their
/// canonical declaration order.
pub fn write_simulation_results(
    output: &impl Output,
    location_key: &str,
    outputs: &SimulationOutputs,
) -> anyhow::Result<()> {
    if output.is_noop() {
        return Ok(());
    }
    let writer = output.writer_for_location_key(location_key)?;
    let mut writer = csv::Writer::from_writer(writer);

    let headers: Vec<ColumnHeader> = ColumnHeader::iter()
        .filter(|header| outputs.series(*header).is_some())
        .collect();
    let mut record = vec!["Hour".to_string()];
    record.extend(headers.iter().map(|header| header.to_string()));
    writer.write_record(&record)?;

    for hour in 0..outputs.total_hours {
        let mut record = vec![hour.to_string()];
        for header in &headers {
            let series = outputs
                .series(*header)
                .expect("filtered to present columns above");
            record.push(series[hour].to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the summary record of one simulation as JSON.
pub fn write_system_details(
    output: &impl Output,
    location_key: &str,
    details: &SystemDetails,
) -> anyhow::Result<()> {
    if output.is_noop() {
        return Ok(());
    }
    let mut writer = output.writer_for_location_key(location_key)?;
    serde_json::to_writer_pretty(&mut writer, details)?;
    writer.flush()?;
    Ok(())
}

/// Write the chained optimisation appraisals as JSON.
pub fn write_appraisals(
    output: &impl Output,
    location_key: &str,
    appraisals: &[SystemAppraisal],
) -> anyhow::Result<()> {
    if output.is_noop() {
        return Ok(());
    }
    let mut writer = output.writer_for_location_key(location_key)?;
    serde_json::to_writer_pretty(&mut writer, appraisals)?;
    writer.flush()?;
    Ok(())
}
