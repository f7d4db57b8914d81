//! Finds the MPI installation (pkg-config, then `mpicc -show`), generates
//! bindings for the MPI API, and compiles the small C shim that exposes
//! macro constants (`MPI_COMM_WORLD`, `MPI_BYTE`, ...) as functions, since
//! bindgen cannot export them.

use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=csrc/shim.c");
    println!("cargo:rerun-if-changed=build.rs");

    let mpi = find_mpi();

    let mut build = cc::Build::new();
    build.file("csrc/shim.c");
    for path in &mpi.include_paths {
        build.include(path);
    }
    build.compile("tagcomm_mpi_shim");

    for path in &mpi.link_paths {
        println!("cargo:rustc-link-search=native={}", path.display());
        println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path.display());
    }
    for lib in &mpi.libs {
        println!("cargo:rustc-link-lib={lib}");
    }

    let mut builder = bindgen::Builder::default()
        .header_contents("wrapper.h", "#include <mpi.h>\n")
        .allowlist_function("MPI_.*")
        .allowlist_type("MPI_.*")
        .layout_tests(false)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()));
    for path in &mpi.include_paths {
        builder = builder.clang_arg(format!("-I{}", path.display()));
    }
    let bindings = builder
        .generate()
        .expect("Unable to generate MPI bindings. Is an MPI development package installed?");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}

struct MpiConfig {
    include_paths: Vec<PathBuf>,
    link_paths: Vec<PathBuf>,
    libs: Vec<String>,
}

fn find_mpi() -> MpiConfig {
    for pkg_name in &["mpich", "ompi", "mpi"] {
        if let Ok(cfg) = try_pkg_config(pkg_name) {
            return cfg;
        }
    }
    if let Ok(cfg) = try_mpicc() {
        return cfg;
    }
    // Last resort: hope mpi.h and libmpi are on the default paths.
    MpiConfig {
        include_paths: vec![],
        link_paths: vec![],
        libs: vec!["mpi".into()],
    }
}

fn try_pkg_config(name: &str) -> Result<MpiConfig, ()> {
    let cflags = Command::new("pkg-config")
        .args(["--cflags", name])
        .output()
        .map_err(|_| ())?;
    let libs = Command::new("pkg-config")
        .args(["--libs", name])
        .output()
        .map_err(|_| ())?;
    if !cflags.status.success() || !libs.status.success() {
        return Err(());
    }
    let mut cfg = MpiConfig {
        include_paths: vec![],
        link_paths: vec![],
        libs: vec![],
    };
    for flag in String::from_utf8_lossy(&cflags.stdout).split_whitespace() {
        if let Some(p) = flag.strip_prefix("-I") {
            cfg.include_paths.push(PathBuf::from(p));
        }
    }
    for flag in String::from_utf8_lossy(&libs.stdout).split_whitespace() {
        if let Some(p) = flag.strip_prefix("-L") {
            cfg.link_paths.push(PathBuf::from(p));
        } else if let Some(l) = flag.strip_prefix("-l") {
            cfg.libs.push(l.to_string());
        }
    }
    if cfg.libs.is_empty() {
        cfg.libs.push("mpi".into());
    }
    Ok(cfg)
}

fn try_mpicc() -> Result<MpiConfig, ()> {
    let out = Command::new("mpicc").arg("-show").output().map_err(|_| ())?;
    if !out.status.success() {
        return Err(());
    }
    let mut cfg = MpiConfig {
        include_paths: vec![],
        link_paths: vec![],
        libs: vec![],
    };
    for flag in String::from_utf8_lossy(&out.stdout).split_whitespace() {
        if let Some(p) = flag.strip_prefix("-I") {
            cfg.include_paths.push(PathBuf::from(p));
        } else if let Some(p) = flag.strip_prefix("-L") {
            cfg.link_paths.push(PathBuf::from(p));
        } else if let Some(l) = flag.strip_prefix("-l") {
            cfg.libs.push(l.to_string());
        }
    }
    if cfg.libs.is_empty() {
        cfg.libs.push("mpi".into());
    }
    Ok(cfg)
}
