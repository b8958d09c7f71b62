use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/correctord.sqlite3";
const UPLOADS_PREFIX: &str = "uploads/";
pub const BUNDLE_FORMAT_V1: &str = "correctord-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub upload_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub upload_count: usize,
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(db::DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": db::now_rfc3339(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    let mut upload_count = 0usize;
    let uploads_dir = workspace_path.join(db::UPLOADS_DIR_NAME);
    if uploads_dir.is_dir() {
        for ent in std::fs::read_dir(&uploads_dir)? {
            let ent = ent?;
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            zip.start_file(format!("{}{}", UPLOADS_PREFIX, name), opts)
                .with_context(|| format!("failed to start upload entry {}", name))?;
            let mut f = File::open(&p)
                .with_context(|| format!("failed to open upload {}", p.to_string_lossy()))?;
            std::io::copy(&mut f, &mut zip)
                .with_context(|| format!("failed to write upload entry {}", name))?;
            upload_count += 1;
        }
    }

    zip.finish().context("failed to finalize bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        upload_count,
    })
}

pub fn import_workspace_bundle(
    bundle_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let f = File::open(bundle_path)
        .with_context(|| format!("failed to open bundle {}", bundle_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(f).context("not a zip archive")?;

    let format = {
        let mut entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle has no manifest.json")?;
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .context("failed to read manifest")?;
        let manifest: serde_json::Value =
            serde_json::from_str(&text).context("manifest is not valid json")?;
        let format = manifest
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if format != BUNDLE_FORMAT_V1 {
            return Err(anyhow!("unsupported bundle format: {:?}", format));
        }
        format
    };

    let db_dest = workspace_path.join(db::DB_FILE_NAME);
    if db_dest.exists() {
        return Err(anyhow!(
            "refusing to overwrite existing workspace database: {}",
            db_dest.to_string_lossy()
        ));
    }
    std::fs::create_dir_all(workspace_path)?;

    {
        let mut entry = archive
            .by_name(DB_ENTRY)
            .context("bundle has no database entry")?;
        let mut out = File::create(&db_dest)
            .with_context(|| format!("failed to create {}", db_dest.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut out).context("failed to extract database")?;
    }

    let mut upload_count = 0usize;
    let uploads_dir = workspace_path.join(db::UPLOADS_DIR_NAME);
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let Some(file_name) = name.strip_prefix(UPLOADS_PREFIX) else {
            continue;
        };
        // Flat uploads directory; reject anything trying to escape it.
        if file_name.is_empty() || file_name.contains('/') || file_name.contains("..") {
            continue;
        }
        std::fs::create_dir_all(&uploads_dir)?;
        let dest = uploads_dir.join(file_name);
        let mut out = File::create(&dest)
            .with_context(|| format!("failed to create {}", dest.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract upload {}", file_name))?;
        upload_count += 1;
    }

    Ok(ImportSummary {
        bundle_format_detected: format,
        upload_count,
    })
}
