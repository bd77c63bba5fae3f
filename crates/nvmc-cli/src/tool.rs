//! Device memory readers: two shell-out implementations behind one trait,
//! used by `extract` to pull a settings-partition dump off a connected
//! accessory instead of a file.
//!
//! The `nrfjprog` reader shells out to the `nrfjprog` CLI and parses its
//! line-oriented memory-read dump rather than binding the native programmer
//! library, matching the "shell out, parse output" style already used for
//! the `nrfutil` reader.

use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use nvmc::device::ToolKind;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} is not installed (or not on PATH)")]
    NotInstalled { tool: &'static str },

    #[error("{tool} command timed out after {timeout:?}: {args}")]
    Timeout { tool: &'static str, args: String, timeout: Duration },

    #[error("{tool} command failed: {args}\n{stderr}")]
    CommandFailed { tool: &'static str, args: String, stderr: String },

    #[error("could not parse {tool} output: {0}")]
    MalformedOutput(String, &'static str),

    #[error("no devices connected")]
    NoDevices,

    #[error("device with serial number {0} not found")]
    DeviceNotFound(String),
}

/// Device-memory acquisition interface, implemented once per external
/// programmer tool. Follows `tool/core.py::Tool`.
pub trait MemoryTool {
    fn list_serials(&self) -> Result<Vec<String>, ToolError>;
    fn read(&self, serial: &str, address: u32, size: u32) -> Result<Vec<u8>, ToolError>;
}

/// Builds the reader for `kind`. Follows `tool/creator.py::tool_instance_create`.
pub fn create(kind: ToolKind) -> Box<dyn MemoryTool> {
    match kind {
        ToolKind::Nrfjprog => Box::new(NrfjprogTool::new()),
        ToolKind::Nrfutil => Box::new(NrfutilTool::new()),
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn run(tool: &'static str, args: &[String], timeout: Duration) -> Result<String, ToolError> {
    if which(tool).is_none() {
        return Err(ToolError::NotInstalled { tool });
    }

    let joined = args.join(" ");
    let mut child = Command::new(tool)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|_| ToolError::NotInstalled { tool })?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(|e| ToolError::CommandFailed {
            tool,
            args: joined.clone(),
            stderr: e.to_string(),
        })? {
            let output = child.wait_with_output().map_err(|e| ToolError::CommandFailed {
                tool,
                args: joined.clone(),
                stderr: e.to_string(),
            })?;
            if !status.success() {
                return Err(ToolError::CommandFailed {
                    tool,
                    args: joined,
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        if std::time::Instant::now() >= deadline {
            let _ = child.kill();
            return Err(ToolError::Timeout { tool, args: joined, timeout });
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// `true` if `program` resolves on `PATH`, mirroring Python's
/// `shutil.which`.
fn which(program: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(program);
        candidate.is_file().then_some(candidate)
    })
}

/// Shells out to the `nrfjprog` CLI. Grounded on `tool/nrfjprog_utils.py`'s
/// `ToolNrfjprog`, reshaped from a native-library binding to a subprocess
/// reader since this toolkit carries no `nrfjprog` FFI crate.
pub struct NrfjprogTool {
    timeout: Duration,
}

impl NrfjprogTool {
    pub fn new() -> Self {
        Self { timeout: DEFAULT_TIMEOUT }
    }
}

impl Default for NrfjprogTool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTool for NrfjprogTool {
    fn list_serials(&self) -> Result<Vec<String>, ToolError> {
        let stdout = run("nrfjprog", &["--ids".to_string()], self.timeout)?;
        let serials: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .collect();
        if serials.is_empty() {
            return Err(ToolError::NoDevices);
        }
        Ok(serials)
    }

    fn read(&self, serial: &str, address: u32, size: u32) -> Result<Vec<u8>, ToolError> {
        let args = vec![
            "--memrd".to_string(),
            format!("{address:#x}"),
            "--n".to_string(),
            size.to_string(),
            "--snr".to_string(),
            serial.to_string(),
        ];
        let stdout = run("nrfjprog", &args, self.timeout)?;
        parse_memrd_dump(&stdout, size as usize)
    }
}

/// Parses `nrfjprog --memrd` output: one line per 16-byte row, formatted
/// `<address>: <hex bytes...> |<ascii>|`.
fn parse_memrd_dump(output: &str, expected_len: usize) -> Result<Vec<u8>, ToolError> {
    let mut bytes = Vec::with_capacity(expected_len);
    for line in output.lines() {
        let Some((_, rest)) = line.split_once(':') else { continue };
        let hex_part = rest.split('|').next().unwrap_or("").trim();
        for token in hex_part.split_whitespace() {
            let byte = u8::from_str_radix(token, 16)
                .map_err(|_| ToolError::MalformedOutput(line.to_string(), "nrfjprog"))?;
            bytes.push(byte);
        }
    }
    if bytes.len() < expected_len {
        return Err(ToolError::MalformedOutput(output.to_string(), "nrfjprog"));
    }
    bytes.truncate(expected_len);
    Ok(bytes)
}

#[derive(Debug, Deserialize)]
struct DeviceListResponse {
    devices: Vec<DeviceListEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceListEntry {
    #[serde(rename = "serialNumber")]
    serial_number: String,
    traits: DeviceTraits,
}

#[derive(Debug, Deserialize)]
struct DeviceTraits {
    jlink: bool,
}

#[derive(Debug, Deserialize)]
struct MemoryReadResponse {
    devices: Vec<MemoryReadDevice>,
}

#[derive(Debug, Deserialize)]
struct MemoryReadDevice {
    #[serde(rename = "memoryData")]
    memory_data: Vec<MemoryDataBlock>,
}

#[derive(Debug, Deserialize)]
struct MemoryDataBlock {
    values: Vec<u8>,
}

/// Shells out to the `nrfutil` CLI's `device` command group with
/// `--json --skip-overhead`, matching `tool/nrfutil_utils.py`'s
/// `ToolNrfutil` exactly (same flags, same `devices[0].memoryData[0].values`
/// response shape).
pub struct NrfutilTool {
    timeout: Duration,
}

impl NrfutilTool {
    pub fn new() -> Self {
        Self { timeout: DEFAULT_TIMEOUT }
    }

    fn cmd_run<T: for<'de> Deserialize<'de>>(&self, args: &[String]) -> Result<T, ToolError> {
        let mut full = vec!["--json".to_string(), "--skip-overhead".to_string()];
        full.extend_from_slice(args);
        let stdout = run("nrfutil", &full, self.timeout)?;
        serde_json::from_str(&stdout).map_err(|e| ToolError::MalformedOutput(e.to_string(), "nrfutil"))
    }
}

impl Default for NrfutilTool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTool for NrfutilTool {
    fn list_serials(&self) -> Result<Vec<String>, ToolError> {
        let response: DeviceListResponse = self.cmd_run(&["device".to_string(), "list".to_string()])?;
        let serials: Vec<String> = response
            .devices
            .into_iter()
            .filter(|d| d.traits.jlink)
            .map(|d| d.serial_number)
            .collect();
        if serials.is_empty() {
            return Err(ToolError::NoDevices);
        }
        Ok(serials)
    }

    fn read(&self, serial: &str, address: u32, size: u32) -> Result<Vec<u8>, ToolError> {
        let args = vec![
            "device".to_string(),
            "x-read".to_string(),
            "--serial-number".to_string(),
            serial.to_string(),
            "--address".to_string(),
            format!("{address:#x}"),
            "--bytes".to_string(),
            format!("{size:#x}"),
        ];
        let response: MemoryReadResponse = self.cmd_run(&args)?;
        let device = response
            .devices
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::DeviceNotFound(serial.to_string()))?;
        let block = device
            .memory_data
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::MalformedOutput("empty memoryData".to_string(), "nrfutil"))?;
        Ok(block.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nrfjprog_memrd_dump() {
        let output = "0x00000000: FF FF FF FF FF FF FF FF FF FF FF FF FF FF FF FF |................|\n\
                       0x00000010: 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F 10 |................|\n";
        let bytes = parse_memrd_dump(output, 32).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 0xff);
        assert_eq!(bytes[16], 0x01);
        assert_eq!(bytes[31], 0x10);
    }

    #[test]
    fn truncates_to_requested_length() {
        let output = "0x00000000: AA BB CC DD |....|\n";
        let bytes = parse_memrd_dump(output, 2).unwrap();
        assert_eq!(bytes, vec![0xaa, 0xbb]);
    }

    #[test]
    fn nrfutil_device_list_json_shape() {
        let json = r#"{"devices":[
            {"serialNumber":"123456789","traits":{"jlink":true}},
            {"serialNumber":"987654321","traits":{"jlink":false}}
        ]}"#;
        let response: DeviceListResponse = serde_json::from_str(json).unwrap();
        let serials: Vec<String> = response.devices.into_iter().filter(|d| d.traits.jlink).map(|d| d.serial_number).collect();
        assert_eq!(serials, vec!["123456789".to_string()]);
    }

    #[test]
    fn nrfutil_memory_read_json_shape() {
        let json = r#"{"devices":[{"memoryData":[{"values":[1,2,3,4]}]}]}"#;
        let response: MemoryReadResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.devices[0].memory_data[0].values, vec![1, 2, 3, 4]);
    }
}
