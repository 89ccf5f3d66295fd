use crate::input;
use anyhow::Result;
use clap::Args;
use reolink_fw_core::{Firmware, Report};
use std::io::{self, Write};

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Don't use the on-disk cache for remote files (URLs)
    #[arg(long)]
    no_cache: bool,
    /// JSON output, with an optional pretty-print indentation level
    #[arg(short = 'j', long, value_name = "INDENT", num_args = 0..=1, default_missing_value = "-1")]
    json: Option<i32>,
    /// URL or on-disk file
    file_or_url: String,
}

impl InfoArgs {
    pub fn run(self) -> Result<()> {
        let resolved = input::resolve(&self.file_or_url, !self.no_cache)?;
        let reports: Vec<(Option<String>, Report)> = resolved
            .iter()
            .map(|r| {
                let result = Firmware::open(r.source.clone()).map(|fw| fw.report());
                match result {
                    Ok(report) => (r.label.clone(), report),
                    Err(e) => (r.label.clone(), error_only_report(e)),
                }
            })
            .collect();

        match self.json {
            Some(indent) => print_json(&reports, indent)?,
            None => print_human(&reports)?,
        }
        Ok(())
    }
}

fn error_only_report(e: reolink_fw_core::FwError) -> Report {
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
        sha256: String::new(),
        error: Some(e.to_string()),
    }
}

fn print_json(reports: &[(Option<String>, Report)], indent: i32) -> Result<()> {
    #[derive(serde::Serialize)]
    struct Entry<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        pak: Option<&'a str>,
        #[serde(flatten)]
        report: &'a Report,
    }
    let entries: Vec<Entry> = reports
        .iter()
        .map(|(label, report)| Entry {
            pak: label.as_deref(),
            report,
        })
        .collect();

    let out = io::stdout();
    if indent < 0 {
        serde_json::to_writer(&out, &entries)?;
    } else {
        let pad = " ".repeat(indent as usize);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(pad.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&out, formatter);
        serde::Serialize::serialize(&entries, &mut ser)?;
    }
    let mut out = io::stdout();
    out.write_all(b"\n")?;
    Ok(())
}

const WIDTH: usize = 21;

fn field(out: &mut impl Write, label: &str, value: &str) -> io::Result<()> {
    writeln!(out, "{label:<WIDTH$}{value}")
}

fn print_human(reports: &[(Option<String>, Report)]) -> Result<()> {
    let mut out = io::BufWriter::new(io::stdout());
    let last = reports.len().saturating_sub(1);
    for (idx, (label, r)) in reports.iter().enumerate() {
        if let Some(label) = label {
            writeln!(out, "{label}")?;
        }
        if let Some(err) = &r.error {
            field(&mut out, "Error:", err)?;
            if idx != last {
                writeln!(out)?;
            }
            continue;
        }

        let mut hw_names: Vec<&str> = [
            r.board_type.as_deref(),
            r.detail_machine_type.as_deref(),
            r.board_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        hw_names.sort_unstable();
        hw_names.dedup();

        let version = match (&r.firmware_version_prefix, &r.version_file) {
            (Some(prefix), Some(file)) => format!("{prefix}.{file}"),
            (Some(prefix), None) => prefix.clone(),
            (None, Some(file)) => file.clone(),
            (None, None) => "Unknown".to_string(),
        };

        let mut fs_types: Vec<&str> = r.filesystems.iter().map(|f| f.kind.as_str()).collect();
        fs_types.sort_unstable();
        fs_types.dedup();
        let fs_names: Vec<&str> = r.filesystems.iter().map(|f| f.name.as_str()).collect();

        field(&mut out, "Model:", r.display_type_info.as_deref().unwrap_or("Unknown"))?;
        field(&mut out, "Hardware info:", &hw_names.join(", "))?;
        field(&mut out, "Device type:", r.device_type.as_deref().unwrap_or("Unknown"))?;
        field(&mut out, "Firmware version:", &version)?;
        field(
            &mut out,
            "Build date:",
            &r.build_date
                .as_deref()
                .map(format_build_date)
                .unwrap_or_else(|| "Unknown".to_string()),
        )?;
        field(&mut out, "Architecture:", &r.architecture)?;
        field(&mut out, "OS:", &r.os)?;
        field(&mut out, "Kernel image name:", r.kernel_image_name.as_deref().unwrap_or("Unknown"))?;
        field(&mut out, "U-Boot version:", r.uboot_version.as_deref().unwrap_or("Unknown"))?;
        if let Some(compiler) = &r.uboot_compiler {
            field(&mut out, "U-Boot compiler:", compiler)?;
        }
        if let Some(linker) = &r.uboot_linker {
            field(&mut out, "U-Boot linker:", linker)?;
        }
        if let Some(vendor) = &r.board_vendor {
            field(&mut out, "Board vendor:", vendor)?;
        }
        field(&mut out, "File system:", &fs_types.join(", "))?;
        field(&mut out, "File system sections:", &fs_names.join(", "))?;
        field(&mut out, "SHA-256:", &r.sha256)?;

        if idx != last {
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// `build_date` carries the `YYMMDD` string the vendor's XML uses verbatim;
/// render it as an ISO date for `info`'s human output the way the original
/// CLI's `datetime.strptime(info.build_date, "%y%m%d")` does.
fn format_build_date(raw: &str) -> String {
    if raw.len() != 6 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.to_string();
    }
    let (yy, rest) = raw.split_at(2);
    let (mm, dd) = rest.split_at(2);
    format!("20{yy}-{mm}-{dd}")
}
