use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use prost::Message;

use crate::{config::FinetuneError, metrics::EvalReport, trainer::SanityDump};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    /// Directory that receives the `events.out.tfevents.*` file, if any.
    pub event_dir: Option<PathBuf>,
}

impl LoggingSettings {
    pub fn new(enable_stdout: bool, event_dir: Option<PathBuf>) -> Self {
        Self {
            enable_stdout,
            event_dir,
        }
    }
}

/// Run output: progress lines on stdout and scalars in a TensorBoard event file.
pub struct Logger {
    settings: LoggingSettings,
    events: Option<EventFile>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, FinetuneError> {
        let events = match settings.event_dir.as_deref() {
            Some(dir) => Some(EventFile::create(dir)?),
            None => None,
        };
        Ok(Self { settings, events })
    }

    pub fn event_file(&self) -> Option<&Path> {
        self.events.as_ref().map(|events| events.path.as_path())
    }

    pub fn log_sanity(&self, dump: &SanityDump) {
        if self.settings.enable_stdout {
            println!("=====sanity check======");
            for (name, value) in dump.fields() {
                println!("{}: {}", name, value);
            }
            println!("=======================");
        }
    }

    pub fn log_step_loss(&self, step: usize, task: &str, loss: f32) {
        if self.settings.enable_stdout {
            println!("step: {}, task: {}, loss: {}", step, task, loss);
        }
    }

    pub fn log_epoch_marker(&self, epoch: usize) {
        if self.settings.enable_stdout {
            println!("=========eval at epoch={}=========", epoch);
        }
    }

    pub fn log_train_loss(&mut self, epoch: usize, task: &str, loss: f32) -> Result<(), FinetuneError> {
        match self.events.as_mut() {
            Some(events) => events.append(
                epoch as i64,
                vec![scalar(format!("{}/train/loss", task), loss as f64)],
            ),
            None => Ok(()),
        }
    }

    /// Prints the split's scores and records them as `<task>/<split>/<metric>` at `epoch`.
    ///
    /// All metrics of the split share one event.
    pub fn log_evaluation(
        &mut self,
        epoch: usize,
        task: &str,
        split: &str,
        report: &EvalReport,
    ) -> Result<(), FinetuneError> {
        if self.settings.enable_stdout {
            let rendered: Vec<String> = report
                .scalars()
                .iter()
                .map(|(name, value)| format!("{}={:.4}", name, value))
                .collect();
            println!(
                "{} {}: {} (examples={})",
                task,
                split,
                rendered.join(" "),
                report.examples
            );
        }

        match self.events.as_mut() {
            Some(events) => {
                let values = report
                    .scalars()
                    .into_iter()
                    .map(|(name, value)| scalar(format!("{}/{}/{}", task, split, name), value))
                    .collect();
                events.append(epoch as i64, values)
            }
            None => Ok(()),
        }
    }

    /// Flushes and closes the event file. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), FinetuneError> {
        match self.events.take() {
            Some(mut events) => events.flush(),
            None => Ok(()),
        }
    }
}

/// Header record every reader expects before any summary.
const FILE_VERSION: &str = "brain.Event:2";

/// Append-only `tfevents` file; every record is flushed as soon as it is written.
struct EventFile {
    path: PathBuf,
    sink: BufWriter<File>,
}

impl EventFile {
    fn create(dir: &Path) -> Result<Self, FinetuneError> {
        fs::create_dir_all(dir).map_err(|err| sink_error("create", dir, err))?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            unix_seconds() as u64,
            hostname()
        ));
        let file = File::create(&path).map_err(|err| sink_error("create", &path, err))?;
        let mut events = Self {
            path,
            sink: BufWriter::new(file),
        };
        events.write(&Event {
            wall_time: unix_seconds(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        Ok(events)
    }

    fn append(&mut self, step: i64, values: Vec<summary::Value>) -> Result<(), FinetuneError> {
        self.write(&Event {
            wall_time: unix_seconds(),
            step,
            file_version: None,
            summary: Some(Summary { value: values }),
        })
    }

    fn write(&mut self, event: &Event) -> Result<(), FinetuneError> {
        let record = frame_record(&event.encode_to_vec());
        self.sink
            .write_all(&record)
            .map_err(|err| sink_error("write", &self.path, err))?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), FinetuneError> {
        self.sink
            .flush()
            .map_err(|err| sink_error("flush", &self.path, err))
    }
}

impl Drop for EventFile {
    fn drop(&mut self) {
        let _ = self.sink.flush();
    }
}

/// Length, masked CRC of the length, payload, masked CRC of the payload.
fn frame_record(payload: &[u8]) -> BytesMut {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len);
    record.put_u32_le(masked_crc32(&len));
    record.put_slice(payload);
    record.put_u32_le(masked_crc32(payload));
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let crc = crc32fast::hash(data);
    crc.rotate_right(15).wrapping_add(0xa282_ead8)
}

fn scalar(tag: String, value: f64) -> summary::Value {
    summary::Value {
        tag,
        simple_value: Some(value as f32),
    }
}

fn sink_error(action: &str, path: &Path, err: io::Error) -> FinetuneError {
    FinetuneError::runtime(format!(
        "failed to {} event file {}: {}",
        action,
        path.display(),
        err
    ))
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
