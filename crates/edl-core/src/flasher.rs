//! Flat-build flashing: rawprogram/patch manifests applied through Firehose.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EdlEvent, EdlObserver};
use crate::firehose::xml::{XmlElement, XmlError, escape_attr, parse_elements};
use crate::firehose::{ACK, FirehoseError, FirehoseResponse, FirehoseServer, PipelineOptions};
use crate::partition::{PartitionInfo, PatchInfo};
use crate::sparse::{self, ChunkReader};
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest: {0}")]
    Xml(#[from] XmlError),

    #[error("Attribute {attribute}=\"{value}\" is not a number")]
    InvalidNumber { attribute: &'static str, value: String },

    #[error("Invalid bypass rule '{0}'")]
    InvalidBypass(String),
}

fn number<N: FromStr>(attribute: &'static str, value: &str) -> Result<N, ManifestError> {
    value
        .trim()
        .parse()
        .map_err(|_| ManifestError::InvalidNumber {
            attribute,
            value: value.to_string(),
        })
}

fn sector_size_number(value: &str) -> Result<u32, ManifestError> {
    match number("SECTOR_SIZE_IN_BYTES", value)? {
        0 => Err(ManifestError::InvalidNumber {
            attribute: "SECTOR_SIZE_IN_BYTES",
            value: value.to_string(),
        }),
        n => Ok(n),
    }
}

/// Attribute value, treating empty as absent.
fn present<'a>(element: &'a XmlElement, key: &str) -> Option<&'a str> {
    element.attr(key).filter(|v| !v.is_empty())
}

/// Parse a rawprogram document. Entries missing a required attribute are
/// skipped; `filename` is resolved against `image_dir`.
pub fn parse_program_manifest(
    content: &str,
    image_dir: &Path,
) -> Result<Vec<PartitionInfo>, ManifestError> {
    let elements = parse_elements(content)?;
    if elements.first().is_none_or(|root| root.name != "data") {
        return Ok(Vec::new());
    }

    let mut partitions = Vec::new();
    for element in elements.iter().filter(|e| e.name == "program") {
        let (Some(sector_size), Some(label), Some(start), Some(count), Some(lun)) = (
            present(element, "SECTOR_SIZE_IN_BYTES"),
            present(element, "label"),
            present(element, "start_sector"),
            present(element, "num_partition_sectors"),
            present(element, "physical_partition_number"),
        ) else {
            debug!(label = ?element.attr("label"), "Skipping incomplete program entry");
            continue;
        };

        partitions.push(PartitionInfo {
            label: label.to_string(),
            lun: number("physical_partition_number", lun)?,
            file_sector_offset: match present(element, "file_sector_offset") {
                Some(v) => number("file_sector_offset", v)?,
                None => 0,
            },
            start_sector: start.to_string(),
            sector_count: number("num_partition_sectors", count)?,
            bytes_per_sector: sector_size_number(sector_size)?,
            is_sparse: element.attr("sparse") == Some("true"),
            source_path: present(element, "filename").map(|f| image_dir.join(f)),
        });
    }
    Ok(partitions)
}

/// Parse a patch document. Unless `include_non_disk`, only patches aimed at
/// `DISK` are kept.
pub fn parse_patch_manifest(
    content: &str,
    include_non_disk: bool,
) -> Result<Vec<PatchInfo>, ManifestError> {
    let elements = parse_elements(content)?;
    if elements.first().is_none_or(|root| root.name != "patches") {
        return Ok(Vec::new());
    }

    let mut patches = Vec::new();
    for element in elements.iter().filter(|e| e.name == "patch") {
        let (Some(sector_size), Some(filename), Some(byte_offset), Some(value), Some(lun), Some(size)) = (
            present(element, "SECTOR_SIZE_IN_BYTES"),
            present(element, "filename"),
            present(element, "byte_offset"),
            present(element, "value"),
            present(element, "physical_partition_number"),
            present(element, "size_in_bytes"),
        ) else {
            continue;
        };

        let patch = PatchInfo {
            sector_size: number("SECTOR_SIZE_IN_BYTES", sector_size)?,
            lun: number("physical_partition_number", lun)?,
            byte_offset: byte_offset.to_string(),
            filename: filename.to_string(),
            size_in_bytes: size.to_string(),
            start_sector: element.attr("start_sector").unwrap_or_default().to_string(),
            value: value.to_string(),
            what: element.attr("what").unwrap_or_default().to_string(),
        };
        if patch.targets_disk() || include_non_disk {
            patches.push(patch);
        }
    }
    Ok(patches)
}

fn manifest_index(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(".xml")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `rawprogramN.xml` and `patchN.xml` files in `dir`, each list ordered by N.
pub fn discover_manifests(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ManifestError> {
    let io_err = |source| ManifestError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut programs = Vec::new();
    let mut patches = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(n) = manifest_index(name, "rawprogram") {
            programs.push((n, path));
        } else if let Some(n) = manifest_index(name, "patch") {
            patches.push((n, path));
        }
    }
    programs.sort();
    patches.sort();
    Ok((
        programs.into_iter().map(|(_, p)| p).collect(),
        patches.into_iter().map(|(_, p)| p).collect(),
    ))
}

fn read_manifest(path: &Path) -> Result<String, ManifestError> {
    fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Render descriptors as a rawprogram document.
///
/// With `default_non_sparse`, every entry is written `sparse="false"`.
pub fn generate_rawprogram(partitions: &[PartitionInfo], default_non_sparse: bool) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<data>\n");
    for p in partitions {
        let filename = p
            .source_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sparse = !default_non_sparse && p.is_sparse;
        let start_byte_hex = if p.label == "BackupGPT" {
            format!(
                "({}*NUM_DISK_SECTORS)-{}.",
                p.bytes_per_sector,
                p.size_in_bytes()
            )
        } else {
            match p.start_sector_value() {
                Some(start) => format!("0x{start:08x}"),
                None => p.start_sector.clone(),
            }
        };
        out.push_str(&format!(
            "  <program SECTOR_SIZE_IN_BYTES=\"{}\" file_sector_offset=\"{}\" filename=\"{}\" label=\"{}\" num_partition_sectors=\"{}\" physical_partition_number=\"{}\" sparse=\"{}\" start_byte_hex=\"{}\" start_sector=\"{}\" />\n",
            p.bytes_per_sector,
            p.file_sector_offset,
            escape_attr(&filename),
            escape_attr(&p.label),
            p.sector_count,
            p.lun,
            sparse,
            escape_attr(&start_byte_hex),
            escape_attr(&p.start_sector),
        ));
    }
    out.push_str("</data>\n");
    out
}

/// Partition excluded from flashing: `label` on one LUN, or on all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassRule {
    pub label: String,
    pub lun: Option<u32>,
}

impl BypassRule {
    pub fn matches(&self, info: &PartitionInfo) -> bool {
        self.label == info.label && self.lun.is_none_or(|lun| lun == info.lun)
    }
}

impl FromStr for BypassRule {
    type Err = ManifestError;

    /// `label`, `label:-1` (all LUNs) or `label:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, lun) = match s.rsplit_once(':') {
            Some((label, "-1")) => (label, None),
            Some((label, lun)) => (
                label,
                Some(
                    lun.parse()
                        .map_err(|_| ManifestError::InvalidBypass(s.to_string()))?,
                ),
            ),
            None => (s, None),
        };
        if label.is_empty() {
            return Err(ManifestError::InvalidBypass(s.to_string()));
        }
        Ok(Self {
            label: label.to_string(),
            lun,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    /// Send sparse images through [`SparsePipeline`](crate::firehose::SparsePipeline).
    pub sparse_pipeline: bool,
    pub pipeline: PipelineOptions,
}

/// Renames progress events after the step being flashed.
struct StepObserver {
    inner: Arc<dyn EdlObserver>,
    step: Mutex<String>,
}

impl StepObserver {
    fn set_step(&self, step: &str) {
        if let Ok(mut current) = self.step.lock() {
            *current = step.to_string();
        }
    }

    fn report(&self, current: u64, total: u64) {
        self.on_event(&EdlEvent::progress("", current, total));
    }
}

impl EdlObserver for StepObserver {
    fn on_event(&self, event: &EdlEvent) {
        match event {
            EdlEvent::Progress { current, total, .. } => {
                let step = self.step.lock().map(|s| s.clone()).unwrap_or_default();
                self.inner
                    .on_event(&EdlEvent::progress(step, *current, *total));
            }
            other => self.inner.on_event(other),
        }
    }
}

/// Applies a parsed flat build.
#[derive(Debug, Clone, Default)]
pub struct ProgramFlasher {
    pub partitions: Vec<PartitionInfo>,
    pub patches: Vec<PatchInfo>,
    pub bypass: Vec<BypassRule>,
    pub options: FlashOptions,
}

impl ProgramFlasher {
    pub fn new(partitions: Vec<PartitionInfo>, patches: Vec<PatchInfo>) -> Self {
        Self {
            partitions,
            patches,
            ..Default::default()
        }
    }

    /// Load every rawprogram and patch manifest found in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, ManifestError> {
        let (program_files, patch_files) = discover_manifests(dir)?;
        let mut partitions = Vec::new();
        for path in &program_files {
            let found = parse_program_manifest(&read_manifest(path)?, dir)
                .inspect_err(|e| warn!(path = %path.display(), error = %e, "Bad program manifest"))?;
            debug!(path = %path.display(), count = found.len(), "Program manifest");
            partitions.extend(found);
        }
        let mut patches = Vec::new();
        for path in &patch_files {
            let found = parse_patch_manifest(&read_manifest(path)?, false)
                .inspect_err(|e| warn!(path = %path.display(), error = %e, "Bad patch manifest"))?;
            patches.extend(found);
        }
        info!(
            partitions = partitions.len(),
            patches = patches.len(),
            "Flat build loaded"
        );
        Ok(Self::new(partitions, patches))
    }

    pub fn with_bypass(mut self, bypass: Vec<BypassRule>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_bypassed(&self, info: &PartitionInfo) -> bool {
        self.bypass.iter().any(|rule| rule.matches(info))
    }

    fn write_one<T: Transport>(
        &self,
        server: &mut FirehoseServer<T>,
        info: &PartitionInfo,
        path: &Path,
    ) -> Result<FirehoseResponse, FirehoseError> {
        if self.options.sparse_pipeline && info.is_sparse && sparse::is_sparse_file(path)? {
            let image = ChunkReader::new(BufReader::new(File::open(path)?))?;
            let summary = server.write_sparse_pipelined(info, image, &self.options.pipeline)?;
            debug!(label = %info.label, batches = summary.batches, "Pipelined write done");
            return Ok(FirehoseResponse {
                status: ACK.to_string(),
                ..Default::default()
            });
        }
        server.write_partition(info)
    }

    /// Write every file-bearing, non-bypassed partition, then apply the
    /// `DISK` patches. Returns the last response; the first rejected patch
    /// ends the run.
    pub fn flash<T: Transport>(
        &self,
        server: &mut FirehoseServer<T>,
    ) -> Result<FirehoseResponse, FirehoseError> {
        let steps = Arc::new(StepObserver {
            inner: server.observer(),
            step: Mutex::new(String::new()),
        });
        let previous = server.set_observer(steps.clone());
        let result = self.run(server, &steps);
        server.set_observer(previous);
        result
    }

    fn run<T: Transport>(
        &self,
        server: &mut FirehoseServer<T>,
        steps: &StepObserver,
    ) -> Result<FirehoseResponse, FirehoseError> {
        let mut response = FirehoseResponse {
            status: ACK.to_string(),
            ..Default::default()
        };

        for info in &self.partitions {
            if self.is_bypassed(info) {
                info!(label = %info.label, lun = info.lun, "Bypassing partition");
                continue;
            }
            let Some(path) = info.source_path.as_deref() else {
                continue;
            };
            steps.set_step(&info.label);
            steps.report(0, 1);
            response = self.write_one(server, info, path)?;
            if !response.is_ack() {
                warn!(label = %info.label, status = %response.status, "Partition write not acknowledged");
            }
        }

        let disk: Vec<&PatchInfo> = self.patches.iter().filter(|p| p.targets_disk()).collect();
        let total = disk.len() as u64;
        steps.set_step("Patch");
        steps.report(0, total);
        for (i, patch) in disk.into_iter().enumerate() {
            steps.report(i as u64 + 1, total);
            response = server.send_patch(patch)?;
            if !response.is_ack() {
                warn!(what = %patch.what, status = %response.status, "Patch rejected");
                return Ok(response);
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::RecordingObserver;
    use crate::firehose::server::tests::{ack, frame};
    use crate::transport::MockTransport;

    const RAWPROGRAM: &str = r#"<?xml version="1.0" ?>
<data>
  <!-- boot images -->
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="boot.img" label="boot_a" num_partition_sectors="16384" physical_partition_number="4" sparse="false" start_sector="1024" />
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="" label="boot_b" num_partition_sectors="16384" physical_partition_number="4" sparse="false" start_sector="17408" />
  <program SECTOR_SIZE_IN_BYTES="4096" filename="super.img" label="super" num_partition_sectors="100" physical_partition_number="0" sparse="true" start_sector="6" />
  <program SECTOR_SIZE_IN_BYTES="4096" label="broken" physical_partition_number="0" start_sector="6" />
</data>
"#;

    const PATCH: &str = r#"<?xml version="1.0" ?>
<patches>
  <patch SECTOR_SIZE_IN_BYTES="4096" byte_offset="80" filename="DISK" physical_partition_number="0" size_in_bytes="8" start_sector="NUM_DISK_SECTORS-1." value="NUM_DISK_SECTORS-6." what="Update last partition" />
  <patch SECTOR_SIZE_IN_BYTES="4096" byte_offset="80" filename="gpt_main0.bin" physical_partition_number="0" size_in_bytes="8" start_sector="1" value="NUM_DISK_SECTORS-6." what="Update last partition" />
</patches>
"#;

    #[test]
    fn test_parse_program_manifest() {
        let parts = parse_program_manifest(RAWPROGRAM, Path::new("/fw")).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].label, "boot_a");
        assert_eq!(parts[0].lun, 4);
        assert_eq!(parts[0].source_path, Some(PathBuf::from("/fw/boot.img")));
        assert_eq!(parts[1].source_path, None);
        assert!(parts[2].is_sparse);
        assert_eq!(parts[2].file_sector_offset, 0);
    }

    #[test]
    fn test_parse_program_manifest_bad_number() {
        let doc = r#"<data><program SECTOR_SIZE_IN_BYTES="4k" label="x" num_partition_sectors="1" physical_partition_number="0" start_sector="0" /></data>"#;
        assert!(matches!(
            parse_program_manifest(doc, Path::new(".")),
            Err(ManifestError::InvalidNumber {
                attribute: "SECTOR_SIZE_IN_BYTES",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_program_manifest_zero_sector_size() {
        let doc = r#"<data><program SECTOR_SIZE_IN_BYTES="0" label="x" num_partition_sectors="1" physical_partition_number="0" start_sector="0" /></data>"#;
        assert!(matches!(
            parse_program_manifest(doc, Path::new(".")),
            Err(ManifestError::InvalidNumber {
                attribute: "SECTOR_SIZE_IN_BYTES",
                value,
            }) if value == "0"
        ));
    }

    #[test]
    fn test_parse_patch_manifest() {
        let disk = parse_patch_manifest(PATCH, false).unwrap();
        assert_eq!(disk.len(), 1);
        assert_eq!(disk[0].value, "NUM_DISK_SECTORS-6.");
        assert_eq!(parse_patch_manifest(PATCH, true).unwrap().len(), 2);
        assert!(parse_patch_manifest(RAWPROGRAM, true).unwrap().is_empty());
    }

    #[test]
    fn test_bypass_rules() {
        let any: BypassRule = "userdata:-1".parse().unwrap();
        let lun0: BypassRule = "modem:0".parse().unwrap();
        let mut info = PartitionInfo::new("userdata", 5, 0, 1, 4096);
        assert!(any.matches(&info));

        info.label = "modem".into();
        assert!(!lun0.matches(&info));
        info.lun = 0;
        assert!(lun0.matches(&info));

        assert_eq!("boot".parse::<BypassRule>().unwrap().lun, None);
        assert!("modem:x".parse::<BypassRule>().is_err());
        assert!(":1".parse::<BypassRule>().is_err());
    }

    #[test]
    fn test_generate_rawprogram() {
        let mut boot = PartitionInfo::new("boot", 0, 256, 16, 4096);
        boot.source_path = Some(PathBuf::from("/tmp/boot.img"));
        let [_, backup] = crate::gpt::pseudo_entries(0, 4096);

        let doc = generate_rawprogram(&[boot, backup], true);
        let parts = parse_program_manifest(&doc, Path::new("/x")).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].source_path, Some(PathBuf::from("/x/boot.img")));
        assert!(doc.contains(r#"start_byte_hex="0x00000100""#));
        assert!(doc.contains(r#"start_byte_hex="(4096*NUM_DISK_SECTORS)-20480.""#));
        assert!(doc.contains(r#"start_sector="NUM_DISK_SECTORS-5.""#));
    }

    #[test]
    fn test_discover_and_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("rawprogram10.xml"), "<data/>").unwrap();
        fs::write(dir.path().join("rawprogram0.xml"), RAWPROGRAM).unwrap();
        fs::write(dir.path().join("rawprogram_unsparse0.xml"), RAWPROGRAM).unwrap();
        fs::write(dir.path().join("patch0.xml"), PATCH).unwrap();

        let (programs, patches) = discover_manifests(dir.path()).unwrap();
        let names: Vec<_> = programs
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["rawprogram0.xml", "rawprogram10.xml"]);
        assert_eq!(patches.len(), 1);

        let flasher = ProgramFlasher::from_dir(dir.path()).unwrap();
        assert_eq!(flasher.partitions.len(), 3);
        assert_eq!(flasher.patches.len(), 1);
    }

    fn disk_patch(what: &str) -> PatchInfo {
        PatchInfo {
            sector_size: 4096,
            filename: "DISK".into(),
            what: what.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_flash_skips_bypassed_and_stops_on_nak() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("modem.img");
        fs::write(&image, vec![3u8; 4096]).unwrap();

        let mut modem = PartitionInfo::new("modem", 0, 100, 1, 4096);
        modem.source_path = Some(image.clone());
        let mut userdata = PartitionInfo::new("userdata", 2, 200, 1, 4096);
        userdata.source_path = Some(image);
        let no_file = PartitionInfo::new("misc", 0, 300, 1, 4096);

        let flasher = ProgramFlasher::new(
            vec![modem, userdata, no_file],
            vec![disk_patch("one"), disk_patch("two"), disk_patch("three")],
        )
        .with_bypass(vec!["userdata:-1".parse().unwrap()]);

        let mock = MockTransport::new();
        // program + closing, then patch ACK, patch NAK.
        mock.queue_str(&ack());
        mock.queue_str(&ack());
        mock.queue_str(&ack());
        mock.queue_str(&frame(r#"<response value="NAK" />"#));

        let observer = Arc::new(RecordingObserver::default());
        let mut server = FirehoseServer::new(mock.clone()).with_observer(observer.clone());
        let response = flasher.flash(&mut server).unwrap();
        assert_eq!(response.status, "NAK");

        let writes = mock.get_writes();
        // program request, data, two patches.
        assert_eq!(writes.len(), 4);
        assert!(String::from_utf8_lossy(&writes[0]).contains(r#"label="modem""#));

        assert_eq!(observer.progress_of("modem"), vec![(0, 1), (4096, 4096)]);
        assert_eq!(observer.progress_of("Patch"), vec![(0, 3), (1, 3), (2, 3)]);
        assert!(observer.progress_of("Write").is_empty());
    }
}
