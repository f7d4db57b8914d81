//! Generates bindings for the libfabric types and exported entry points,
//! and compiles a C shim wrapping the parts of the API that are static
//! inline functions dispatching through ops tables (fi_tsend, fi_cq_read,
//! and friends), which bindgen cannot bind directly.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=csrc/shim.c");
    println!("cargo:rerun-if-changed=build.rs");

    let include = find_fabric_include();

    let mut build = cc::Build::new();
    build.file("csrc/shim.c");
    if let Some(path) = &include {
        build.include(path);
    }
    build.compile("tagcomm_fi_shim");

    println!("cargo:rustc-link-lib=fabric");
    if let Some(path) = &include {
        println!(
            "cargo:rustc-link-search=native={}",
            path.parent().unwrap().join("lib").display()
        );
    }

    let mut builder = bindgen::Builder::default()
        .header_contents(
            "wrapper.h",
            "#include <rdma/fabric.h>\n\
             #include <rdma/fi_domain.h>\n\
             #include <rdma/fi_endpoint.h>\n\
             #include <rdma/fi_tagged.h>\n\
             #include <rdma/fi_errno.h>\n",
        )
        .allowlist_function("fi_getinfo")
        .allowlist_function("fi_freeinfo")
        .allowlist_function("fi_fabric")
        .allowlist_function("fi_strerror")
        .allowlist_type("fi_.*")
        .allowlist_type("fid_.*")
        .allowlist_var("FI_.*")
        .layout_tests(false);

    if let Some(path) = &include {
        builder = builder.clang_arg(format!("-I{}", path.display()));
    }

    let bindings = builder
        .generate()
        .expect("Unable to generate libfabric bindings. Is libfabric-dev installed?");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}

fn find_fabric_include() -> Option<PathBuf> {
    let candidates = ["/usr/include", "/usr/local/include", "/opt/libfabric/include"];
    for path in &candidates {
        if PathBuf::from(path).join("rdma/fabric.h").exists() {
            return Some(PathBuf::from(path));
        }
    }

    if let Ok(output) = std::process::Command::new("pkg-config")
        .args(["--cflags", "libfabric"])
        .output()
    {
        if output.status.success() {
            let flags = String::from_utf8_lossy(&output.stdout);
            for flag in flags.split_whitespace() {
                if let Some(path) = flag.strip_prefix("-I") {
                    return Some(PathBuf::from(path));
                }
            }
        }
    }

    None
}
