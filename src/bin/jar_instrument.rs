use std::env;
use std::fs::File;
use std::io::{Read, Write};
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use jvm_probe_weaver::config::InstrumentConfig;
use jvm_probe_weaver::pass::ClassInstrumentor;

const USAGE: &str = "usage: jar_instrument IN_JAR OUT_JAR [OPTIONS]";

struct Entry {
    name: String,
    compression: CompressionMethod,
    last_modified: DateTime,
    unix_mode: Option<u32>,
    is_dir: bool,
    bytes: Vec<u8>,
}

/// Signature files of a signed JAR. They stop matching once a class changes.
fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper.starts_with("SIG-") || [".SF", ".RSA", ".DSA", ".EC"].iter().any(|ext| upper.ends_with(ext))
}

enum Outcome {
    Copied,
    Instrumented { methods: usize, failed_methods: usize },
    Failed,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let in_path = args.next().ok_or(USAGE)?;
    let out_path = args.next().ok_or(USAGE)?;
    let config = InstrumentConfig::from_options(&args.next().unwrap_or_default())?;
    let instrumentor = ClassInstrumentor::new(config);

    let mut zip = ZipArchive::new(File::open(&in_path)?)?;
    let mut entries = Vec::with_capacity(zip.len());
    let mut total_bytes: u64 = 0;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        total_bytes += bytes.len() as u64;
        entries.push(Entry {
            name: file.name().to_string(),
            compression: file.compression(),
            last_modified: file.last_modified(),
            unix_mode: file.unix_mode(),
            is_dir: file.is_dir(),
            bytes,
        });
    }

    let start = Instant::now();
    let results: Vec<(Vec<u8>, Outcome)> = entries
        .par_iter()
        .map(|entry| {
            if entry.is_dir || !entry.name.ends_with(".class") {
                return (entry.bytes.clone(), Outcome::Copied);
            }
            match instrumentor.instrument_class(&entry.bytes) {
                Ok(out) => {
                    let outcome = Outcome::Instrumented {
                        methods: out.report.instrumented.len(),
                        failed_methods: out.report.failures().count(),
                    };
                    (out.bytes, outcome)
                }
                Err(error) => {
                    warn!(entry = %entry.name, %error, "copying class uninstrumented");
                    (entry.bytes.clone(), Outcome::Failed)
                }
            }
        })
        .collect();
    let dur = start.elapsed();

    let rewritten = results
        .iter()
        .any(|(_, outcome)| matches!(outcome, Outcome::Instrumented { methods, .. } if *methods > 0));

    let mut writer = ZipWriter::new(File::create(&out_path)?);
    let mut signatures_removed: u64 = 0;
    let mut class_files: u64 = 0;
    let mut methods: u64 = 0;
    let mut failed_methods: u64 = 0;
    let mut failed: u64 = 0;
    for (entry, (bytes, outcome)) in entries.iter().zip(&results) {
        if rewritten && is_signature_file(&entry.name) {
            signatures_removed += 1;
            continue;
        }
        let mut options = FileOptions::default()
            .compression_method(entry.compression)
            .last_modified_time(entry.last_modified);
        if let Some(mode) = entry.unix_mode {
            options = options.unix_permissions(mode);
        }
        if entry.is_dir {
            writer.add_directory(entry.name.as_str(), options)?;
            continue;
        }
        writer.start_file(entry.name.as_str(), options)?;
        writer.write_all(bytes)?;
        match outcome {
            Outcome::Copied => {}
            Outcome::Instrumented { methods: m, failed_methods: f } => {
                class_files += 1;
                methods += *m as u64;
                failed_methods += *f as u64;
            }
            Outcome::Failed => {
                class_files += 1;
                failed += 1;
            }
        }
    }
    writer.finish()?;
    if signatures_removed > 0 {
        warn!(files = signatures_removed, "removed signature files; the output jar is unsigned");
    }
    info!(out = %out_path, "wrote instrumented jar");

    let secs = dur.as_secs_f64();
    let mb = total_bytes as f64 / (1024.0 * 1024.0);
    let ns_per = if class_files > 0 {
        (dur.as_nanos() as f64) / (class_files as f64)
    } else {
        0.0
    };

    println!("in_jar={}", in_path);
    println!("out_jar={}", out_path);
    println!("class_files={}", class_files);
    println!("methods_instrumented={} methods_failed={}", methods, failed_methods);
    println!("classes_failed={}", failed);
    println!("signatures_removed={}", signatures_removed);
    println!("total_mb={:.3}", mb);
    println!("instrument_time_ms={:.3}", secs * 1000.0);
    println!("ns_per_class={:.1}", ns_per);

    Ok(())
}
