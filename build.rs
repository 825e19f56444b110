use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// `ort` is built with `load-dynamic`, so the runtime library has to sit next to
// the produced binaries. Vendored copies live in `vendor/onnxruntime/<platform>`.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=vendor/onnxruntime");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let Some((platform, extension)) = runtime_library(&target_os) else {
        return;
    };
    match stage_runtime_libraries(platform, extension) {
        Ok(0) => println!(
            "cargo:warning=No vendored ONNX Runtime for {platform}; set ORT_DYLIB_PATH at runtime"
        ),
        Ok(_) => {}
        Err(err) => println!("cargo:warning=Failed to stage ONNX Runtime libraries: {err}"),
    }
}

fn runtime_library(target_os: &str) -> Option<(&'static str, &'static str)> {
    match target_os {
        "windows" => Some(("win-x64-directml", "dll")),
        "linux" => Some(("linux-x64", "so")),
        "macos" => Some(("osx-universal2", "dylib")),
        _ => None,
    }
}

fn target_dir() -> std::io::Result<PathBuf> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap_or_default());
    out_dir
        .parent()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "missing target dir"))
}

fn stage_runtime_libraries(platform: &str, extension: &str) -> std::io::Result<usize> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap_or_default());
    let src_dir = manifest_dir.join("vendor").join("onnxruntime").join(platform);
    if !src_dir.exists() {
        return Ok(0);
    }
    let dest_dir = target_dir()?.join("onnxruntime");
    fs::create_dir_all(&dest_dir)?;
    let mut staged = 0;
    for entry in fs::read_dir(&src_dir)? {
        let path = entry?.path();
        let is_library = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.ends_with(&format!(".{extension}")) || name.contains(&format!(".{extension}."))
            });
        if !is_library {
            continue;
        }
        if let Some(name) = path.file_name() {
            fs::copy(&path, dest_dir.join(name))?;
            staged += 1;
        }
    }
    Ok(staged)
}
