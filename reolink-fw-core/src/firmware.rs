//! The firmware façade: binds the PAK decoder, the compression kit, the
//! image-header decoders, and the three file-system readers into one
//! report or one on-disk extraction (spec §4.8).

use crate::byteio::{ByteSource, Window};
use crate::compress;
use crate::error::{FwError, Result};
use crate::fs::FsKind;
use crate::headers::{fdt, uimage};
use crate::pak::{self, Pak, Section, KERNEL_NAMES, UBOOT_NAMES};
use crate::util::sha256_hex;
use regex::bytes::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, debug_span};

/// One file-system section as it will be reported/extracted: its PAK
/// section name and the detected format name (`squashfs`, `cramfs`,
/// `ubifs`, or `ubi`-followed-by-the-inner-kind since `fs::FsKind::kind_name`
/// already unwraps through the UBI layer).
#[derive(Debug, Clone, serde::Serialize)]
pub struct FsSectionInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// The flat record published by `info`/`extract` (spec §3's Report).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    pub display_type_info: Option<String>,
    pub board_type: Option<String>,
    pub board_name: Option<String>,
    pub build_date: Option<String>,
    pub detail_machine_type: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub firmware_version_prefix: Option<String>,
    pub version_file: Option<String>,
    pub os: String,
    pub architecture: String,
    pub kernel_image_name: Option<String>,
    pub linux_banner: Option<String>,
    pub uboot_version: Option<String>,
    pub uboot_compiler: Option<String>,
    pub uboot_linker: Option<String>,
    pub board_vendor: Option<String>,
    pub filesystems: Vec<FsSectionInfo>,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct Lazy {
    uboot_section: OnceLock<Option<Section>>,
    kernel_section: OnceLock<Option<Section>>,
    fdt_section: OnceLock<Option<Section>>,
    uboot_decompressed: OnceLock<Result<Arc<Vec<u8>>>>,
    kernel_decompressed: OnceLock<Result<Arc<Vec<u8>>>>,
    fdt_parsed: OnceLock<Option<(Vec<u8>, fdt::FdtHeader)>>,
    app_fs: OnceLock<Result<Arc<FsKind>>>,
    sha256: OnceLock<Result<String>>,
}

/// Owns one byte source and its parsed PAK header; every other field is
/// derived lazily and memoized on first access, safe under concurrent
/// first-read (spec's Design Notes — "wrap in a once-initialiser").
pub struct Firmware {
    pak: Pak,
    lazy: Lazy,
}

const DVR_XML_KEYS: &[&str] = &[
    "firmware_version_prefix",
    "board_type",
    "board_name",
    "build_date",
    "display_type_info",
    "detail_machine_type",
    "type",
];

fn version_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"echo (v[23]\.0\.0)").unwrap())
}

fn uboot_version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"U-Boot [0-9]{4}\.[0-9]{2}.*? \(.*?\)").unwrap())
}

fn linux_banner_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Linux version .+ \(.+@.+\) \(.+\) .+").unwrap())
}

fn gm_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^GM\d{4}").unwrap())
}

fn gcc_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"GCC: \([^)]*\) [0-9][^\r\n]*").unwrap())
}

fn linker_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Linker: [^\r\n]*").unwrap())
}

impl Firmware {
    /// Open `source` as a single PAK archive. Use [`crate::archive`] first
    /// to split a ZIP into its member PAK byte sources.
    pub fn open(source: Arc<dyn ByteSource>) -> Result<Firmware> {
        let pak = Pak::open(source)?;
        Ok(Firmware {
            pak,
            lazy: Lazy::default(),
        })
    }

    fn section_bytes(&self, section: &Section) -> Result<Vec<u8>> {
        let mut window = self.pak.open_section(section);
        Ok(window.read_to_end()?)
    }

    fn uboot_section(&self) -> Option<&Section> {
        self.lazy
            .uboot_section
            .get_or_init(|| self.pak.section_by_logical_name(UBOOT_NAMES).cloned())
            .as_ref()
    }

    fn kernel_section(&self) -> Option<&Section> {
        self.lazy
            .kernel_section
            .get_or_init(|| self.pak.section_by_logical_name(KERNEL_NAMES).cloned())
            .as_ref()
    }

    fn fdt_section(&self) -> Option<&Section> {
        self.lazy
            .fdt_section
            .get_or_init(|| self.pak.section_by_name("fdt").cloned())
            .as_ref()
    }

    /// The application FS (spec §4.8 step 3): the last section among
    /// `{fs, rootfs, app}` in PAK order (`app` always wins when present).
    fn app_fs_section(&self) -> Option<&Section> {
        self.pak.fs_sections().into_iter().last()
    }

    /// Every nonzero-length rootfs/application section, in PAK order —
    /// what both the report's `filesystems` list and whole-firmware
    /// extraction iterate over.
    pub fn fs_sections(&self) -> Vec<&Section> {
        self.pak.fs_sections()
    }

    /// SHA-256 of the whole PAK byte source (spec §3, §8 invariant).
    pub fn sha256(&self) -> Result<&str> {
        match self
            .lazy
            .sha256
            .get_or_init(|| {
                let _span = debug_span!("sha256_pak").entered();
                let window = Window::whole(Arc::clone(self.pak.source()));
                sha256_hex(window).map_err(FwError::from)
            })
        {
            Ok(s) => Ok(s.as_str()),
            Err(e) => Err(clone_err(e)),
        }
    }

    /// U-Boot decompression (spec §4.8 step 6): BCL if the magic is
    /// present, else the MStar legacy-image-header-wrapped LZMA variant,
    /// else the section is already plain.
    pub fn uboot_decompressed(&self) -> Result<Arc<Vec<u8>>> {
        self.lazy
            .uboot_decompressed
            .get_or_init(|| {
                let _span = debug_span!("uboot_decompress").entered();
                let section = self
                    .uboot_section()
                    .ok_or(FwError::MissingSection("uboot"))?;
                let raw = self.section_bytes(section)?;
                let out = if uimage::is_mstar_wrapped(&raw) {
                    let payload = &raw[uimage::HEADER_LEN..];
                    crate::compress::lzma::decompress_lzma(payload)?
                } else {
                    compress::decompress_uboot_payload(&raw)?
                };
                debug!(len = out.len(), "uboot_decompressed");
                Ok(Arc::new(out))
            })
            .as_ref()
            .map(Arc::clone)
            .map_err(clone_err)
    }

    /// Kernel decompression (spec §4.8 step 7).
    pub fn kernel_decompressed(&self) -> Result<Arc<Vec<u8>>> {
        self.lazy
            .kernel_decompressed
            .get_or_init(|| {
                let _span = debug_span!("kernel_decompress").entered();
                let section = self
                    .kernel_section()
                    .ok_or(FwError::MissingSection("kernel"))?;
                let raw = self.section_bytes(section)?;
                let after_header = raw
                    .get(uimage::HEADER_LEN..)
                    .ok_or(FwError::Truncated("kernel section"))?;
                let out = compress::decompress_kernel_payload(after_header)?;
                debug!(len = out.len(), "kernel_decompressed");
                Ok(Arc::new(out))
            })
            .as_ref()
            .map(Arc::clone)
            .map_err(clone_err)
    }

    fn kernel_raw(&self) -> Result<Vec<u8>> {
        let section = self
            .kernel_section()
            .ok_or(FwError::MissingSection("kernel"))?;
        self.section_bytes(section)
    }

    /// FDT discovery (spec §4.8 step 8): `fdt` section, then raw kernel
    /// bytes, then decompressed kernel bytes; first header whose `model`
    /// property is non-empty.
    fn fdt(&self) -> Option<&(Vec<u8>, fdt::FdtHeader)> {
        self.lazy
            .fdt_parsed
            .get_or_init(|| {
                let _span = debug_span!("fdt_discover").entered();
                let candidates: Vec<Vec<u8>> = [
                    self.fdt_section().and_then(|s| self.section_bytes(s).ok()),
                    self.kernel_section().and_then(|s| self.section_bytes(s).ok()),
                    self.kernel_decompressed().ok().map(|b| (*b).clone()),
                ]
                .into_iter()
                .flatten()
                .collect();

                for bytes in candidates {
                    for offset in fdt::find_candidates(&bytes) {
                        let Some(slice) = bytes.get(offset..) else {
                            continue;
                        };
                        let Ok(header) = fdt::parse(slice) else {
                            continue;
                        };
                        if fdt::find_model(slice, &header)
                            .map(|m| !m.is_empty())
                            .unwrap_or(false)
                        {
                            return Some((slice.to_vec(), header));
                        }
                    }
                }
                None
            })
            .as_ref()
    }

    /// U-Boot compiler/linker banner lines (spec §4.8 step 6's "compiler +
    /// linker banner pattern"), alongside `uboot_version`.
    fn uboot_compiler_linker(&self) -> (Option<String>, Option<String>) {
        let Ok(uboot) = self.uboot_decompressed() else {
            return (None, None);
        };
        let compiler = gcc_line_regex()
            .find(&uboot)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string());
        let linker = linker_line_regex()
            .find(&uboot)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string());
        (compiler, linker)
    }

    /// Board vendor (spec §4.8 step 9).
    fn board_vendor(&self) -> Option<String> {
        if let Some((bytes, header)) = self.fdt() {
            if let Some(compatible) = find_compatible(bytes, header) {
                let lower = compatible.to_ascii_lowercase();
                return Some(if lower.contains("novatek") {
                    "Novatek".to_string()
                } else if lower.contains("sstar") {
                    "MStar/SigmaStar".to_string()
                } else if lower.contains("hisilicon") {
                    "HiSilicon".to_string()
                } else {
                    compatible
                });
            }
        }
        let uboot = self.uboot_decompressed().ok()?;
        if gm_prefix_regex().is_match(&uboot[..uboot.len().min(6)]) {
            return Some("Grain Media".to_string());
        }
        if find_subslice(&uboot, b"HISILICON LOGO MAGIC").is_some() {
            return Some("HiSilicon".to_string());
        }
        None
    }

    /// Open the application FS, caching the opened reader across calls
    /// (metadata extraction and board-vendor derivation both need it).
    fn app_fs(&self) -> Result<Arc<FsKind>> {
        self.lazy
            .app_fs
            .get_or_init(|| {
                let _span = debug_span!("open_app_fs").entered();
                let section = self
                    .app_fs_section()
                    .ok_or(FwError::MissingSection("fs/rootfs/app"))?;
                let bytes = self.section_bytes(section)?;
                FsKind::open(&bytes).map(Arc::new)
            })
            .as_ref()
            .map(Arc::clone)
            .map_err(clone_err)
    }

    /// Metadata bundle (spec §4.8 step 5): probed at the image root first,
    /// then under `/mnt/app/`.
    fn read_metadata_file(&self, name: &str) -> Option<Vec<u8>> {
        let fs = self.app_fs().ok()?;
        fs.read_file(name).ok()
    }

    /// Build the full report for this PAK (spec §3, §4.8). Never fails:
    /// any step past PAK-open failing is recorded in `error` instead, per
    /// the failure policy in §4.8/§7.
    pub fn report(&self) -> Report {
        let _span = debug_span!("report").entered();
        match self.try_report() {
            Ok(report) => report,
            Err(e) => self.error_report(e),
        }
    }

    fn error_report(&self, e: FwError) -> Report {
        Report {
            display_type_info: None,
            board_type: None,
            board_name: None,
            build_date: None,
            detail_machine_type: None,
            device_type: None,
            firmware_version_prefix: None,
            version_file: None,
            os: "Unknown".to_string(),
            architecture: "Unknown".to_string(),
            kernel_image_name: None,
            linux_banner: None,
            uboot_version: None,
            uboot_compiler: None,
            uboot_linker: None,
            board_vendor: None,
            filesystems: Vec::new(),
            sha256: self.sha256().unwrap_or_default().to_string(),
            error: Some(e.to_string()),
        }
    }

    fn try_report(&self) -> Result<Report> {
        let sha256 = self.sha256()?.to_string();

        let filesystems: Vec<FsSectionInfo> = self
            .fs_sections()
            .into_iter()
            .map(|s| {
                let kind = self
                    .section_bytes(s)
                    .ok()
                    .and_then(|bytes| FsKind::open(&bytes).ok())
                    .map(|fs| fs.kind_name().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                FsSectionInfo {
                    name: s.name.clone(),
                    kind,
                }
            })
            .collect();

        // Metadata files: app FS must open for these, but a failure here is
        // a required step (spec §7) — it aborts the whole report.
        let _ = self.app_fs()?;
        let dvr_xml = self.read_metadata_file("dvr.xml");
        let xml_attrs = dvr_xml
            .as_deref()
            .and_then(|bytes| parse_xml_attrs(bytes).ok());

        let mut xml_get = |key: &str| -> Option<String> {
            xml_attrs
                .as_ref()
                .and_then(|m| m.get(key).cloned())
                .filter(|v| !v.is_empty())
        };

        let version_file = self
            .read_metadata_file("version_file")
            .map(|b| String::from_utf8_lossy(&b).trim().to_string());

        let mut firmware_version_prefix = xml_get("firmware_version_prefix");
        if firmware_version_prefix.is_none() {
            let fallback_bytes = self
                .read_metadata_file("dvr")
                .or_else(|| self.read_metadata_file("router"));
            firmware_version_prefix = fallback_bytes.and_then(|bytes| {
                version_prefix_regex()
                    .captures(&bytes)
                    .and_then(|c| c.get(1))
                    .map(|m| String::from_utf8_lossy(m.as_bytes()).to_string())
            });
        }

        let uboot_bytes = self.uboot_decompressed().ok();
        let uboot_version = uboot_bytes.as_ref().and_then(|b| {
            uboot_version_regex()
                .find(b)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).to_string())
        });

        let (uboot_compiler, uboot_linker) = self.uboot_compiler_linker();

        let kernel_bytes = self.kernel_decompressed().ok();
        let linux_banner = kernel_bytes.as_ref().and_then(|b| {
            linux_banner_regex()
                .find(b)
                .map(|m| String::from_utf8_lossy(m.as_bytes()).to_string())
        });

        let kernel_image_name = self
            .kernel_raw()
            .ok()
            .and_then(|raw| uimage::parse(&raw).ok())
            .map(|h| h.name);

        let architecture = self
            .kernel_raw()
            .ok()
            .and_then(|raw| uimage::parse(&raw).ok())
            .map(|h| h.arch.name().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let os = self
            .kernel_raw()
            .ok()
            .and_then(|raw| uimage::parse(&raw).ok())
            .map(|h| h.os.name().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(Report {
            display_type_info: xml_get("display_type_info"),
            board_type: xml_get("board_type"),
            board_name: xml_get("board_name"),
            build_date: xml_get("build_date"),
            detail_machine_type: xml_get("detail_machine_type"),
            device_type: xml_get("type"),
            firmware_version_prefix,
            version_file,
            os,
            architecture,
            kernel_image_name,
            linux_banner,
            uboot_version,
            uboot_compiler,
            uboot_linker,
            board_vendor: self.board_vendor(),
            filesystems,
            sha256,
            error: None,
        })
    }

    /// Whole-firmware extraction (spec §4.8 step 11, §6 persisted layout).
    pub fn extract(&self, dest: &std::path::Path, force: bool) -> Result<()> {
        let _span = debug_span!("extract", dest = %dest.display()).entered();
        std::fs::create_dir_all(dest)?;

        for section in self.fs_sections() {
            let bytes = self.section_bytes(section)?;
            let fs = FsKind::open(&bytes)?;
            let rootfs_name = self.rootfs_dir_name(section);
            let sub = if section.name == "app" {
                dest.join(&rootfs_name).join("mnt").join("app")
            } else {
                dest.join(&rootfs_name)
            };
            fs.extract(&sub, force)?;
        }

        let uboot = self.uboot_decompressed()?;
        write_file(&dest.join("uboot"), &uboot, force)?;

        let kernel = self.kernel_decompressed()?;
        write_file(&dest.join("kernel"), &kernel, force)?;

        if let Some(config) = extract_kernel_config(&kernel) {
            write_file(&dest.join(".config"), &config, force)?;
        }

        if let Some((bytes, header)) = self.fdt() {
            if let Some(text) = fdt::to_dts_text(bytes, header) {
                write_file(&dest.join("camera.dts"), text.as_bytes(), force)?;
            }
        }

        Ok(())
    }

    /// The directory name an `app`/`fs`/`rootfs` section's rootfs shares:
    /// the original's `extract_pak` uses whichever non-`app` rootfs section
    /// name is present; if only `app` exists (no bare rootfs section), its
    /// own name is used as the root.
    fn rootfs_dir_name(&self, section: &Section) -> String {
        if section.name != "app" {
            return section.name.clone();
        }
        self.fs_sections()
            .into_iter()
            .find(|s| s.name != "app")
            .map(|s| s.name.clone())
            .unwrap_or_else(|| section.name.clone())
    }
}

fn clone_err(e: &FwError) -> FwError {
    // `FwError` is not `Clone` (its `Io` variant wraps `std::io::Error`,
    // which isn't); re-render it as a `DecoderFailed` so memoized failures
    // can be reported from every caller instead of only the first.
    FwError::DecoderFailed("cached", e.to_string())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read the FDT's root `compatible` property the same minimal way
/// `fdt::find_model` reads `model`.
fn find_compatible(bytes: &[u8], header: &fdt::FdtHeader) -> Option<String> {
    fdt::find_property(bytes, header, "compatible")
}

/// Parse `dvr.xml`'s root element attributes into a name→value map,
/// mirroring the original's `dict(fromstring(files["dvr.xml"]).items())`.
fn parse_xml_attrs(bytes: &[u8]) -> Result<std::collections::HashMap<String, String>> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text = true;
    let mut map = std::collections::HashMap::new();
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| FwError::DecoderFailed("dvr.xml", e.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    if !DVR_XML_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    let value = attr
                        .unescape_value()
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    map.insert(key, value);
                }
                break; // only the root element's attributes are needed
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(map)
}

/// Extract an embedded `.config` from a decompressed kernel image, between
/// the `IKCFG_ST`/`IKCFG_ED` markers, gzip-decompressed.
fn extract_kernel_config(kernel: &[u8]) -> Option<Vec<u8>> {
    const START: &[u8] = b"IKCFG_ST";
    const END: &[u8] = b"IKCFG_ED";
    let start = find_subslice(kernel, START)? + START.len();
    let end = start + find_subslice(&kernel[start..], END)?;
    crate::compress::gzip::decompress(&kernel[start..end]).ok()
}

fn write_file(path: &std::path::Path, bytes: &[u8], force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(FwError::Exists(path.display().to_string()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byteio::MemSource;

    fn build_pak(sections: &[(&str, &[u8])]) -> Vec<u8> {
        let count = sections.len() as u32;
        let header_len = pak::header_size(count, count);
        let mut body = Vec::new();
        let mut descriptors = Vec::new();
        let mut cursor = header_len as u32;
        for (name, data) in sections {
            let mut name_buf = [0u8; 24];
            name_buf[..name.len()].copy_from_slice(name.as_bytes());
            descriptors.extend_from_slice(&name_buf);
            descriptors.extend_from_slice(&cursor.to_le_bytes());
            descriptors.extend_from_slice(&(data.len() as u32).to_le_bytes());
            descriptors.extend_from_slice(&0u32.to_le_bytes());
            body.extend_from_slice(data);
            cursor += data.len() as u32;
        }
        let mut v = vec![0u8; 12];
        v[..4].copy_from_slice(&pak::MAGIC);
        v.extend_from_slice(&descriptors);
        for _ in 0..count {
            v.extend_from_slice(&[0u8; 24]);
            v.extend_from_slice(&0u32.to_le_bytes());
            v.extend_from_slice(&0u32.to_le_bytes());
        }
        v.extend_from_slice(&body);
        v
    }

    #[test]
    fn missing_uboot_section_surfaces_in_report_error() {
        let bytes = build_pak(&[("kernel", &[0u8; 64]), ("fs", b"hsqs0000")]);
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(bytes));
        let fw = Firmware::open(source).unwrap();
        let report = fw.report();
        assert!(report.error.is_some());
    }

    #[test]
    fn sha256_is_stable_across_calls() {
        let bytes = build_pak(&[("uboot", b"abcd"), ("kernel", &[0u8; 64])]);
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(bytes));
        let fw = Firmware::open(source).unwrap();
        let first = fw.sha256().unwrap().to_string();
        let second = fw.sha256().unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn fs_sections_reports_app_last_when_both_present() {
        let bytes = build_pak(&[
            ("uboot", b"abcd"),
            ("kernel", &[0u8; 64]),
            ("rootfs", b"hsqs0000"),
            ("app", b"hsqs1111"),
        ]);
        let source: Arc<dyn ByteSource> = Arc::new(MemSource::new(bytes));
        let fw = Firmware::open(source).unwrap();
        let names: Vec<&str> = fw.fs_sections().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["rootfs", "app"]);
        assert_eq!(fw.app_fs_section().unwrap().name, "app");
    }
}
