use std::env;
use std::path::PathBuf;

/// Probe a library with `pkg-config` and emit its link directives.
fn probe(name: &str, atleast: &str) -> Result<Vec<String>, ()> {
    let lib = pkg_config::Config::new()
        .atleast_version(atleast)
        .statik(false)
        .probe(name)
        .map_err(|_| ())?;

    Ok(lib
        .include_paths
        .iter()
        .map(|p| p.to_str().unwrap().to_owned())
        .collect())
}

fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`ibfabric` currently only supports 64-bit platforms");
    }

    println!("cargo:rerun-if-changed=src/bindings/fabric.h");

    let mut include_dirs = probe("libibverbs", "1.8.28")
        .expect("cannot find a libibverbs installation via pkg-config");
    include_dirs.extend(
        probe("librdmacm", "1.2.28").expect("cannot find a librdmacm installation via pkg-config"),
    );
    include_dirs.sort();
    include_dirs.dedup();

    gen_fabric_bindings(include_dirs);
}

fn gen_fabric_bindings(include_dirs: Vec<String>) {
    let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
    let bindings = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/fabric.h")
        .allowlist_function("ibv_.*")
        .allowlist_function("rdma_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("rdma_.*")
        .allowlist_type("verbs_.*")
        .allowlist_type("ib_uverbs_access_flags")
        // Types taken from `libc` or written by hand in `src/bindings/mod.rs`
        // because they contain unions or platform-dependent members.
        .blocklist_type("pthread_.*")
        .blocklist_type("in6_addr")
        .blocklist_type("sockaddr.*")
        .blocklist_type("timespec")
        .blocklist_type("ibv_ah_attr")
        .blocklist_type("ibv_async_event")
        .blocklist_type("ibv_flow_spec")
        .blocklist_type("ibv_gid")
        .blocklist_type("ibv_global_route")
        .blocklist_type("ibv_send_wr.*")
        .blocklist_type("ibv_wc")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_device_cap_flags")
        .bitfield_enum("ibv_port_cap_flags")
        .bitfield_enum("ibv_qp_attr_mask")
        .bitfield_enum("ibv_wc_flags")
        .bitfield_enum("ibv_srq_attr_mask")
        .bitfield_enum("ibv_srq_init_attr_mask")
        .default_enum_style(bindgen::EnumVariation::ModuleConsts)
        .derive_default(true)
        .derive_debug(true)
        .prepend_enum_name(false)
        .generate()
        .expect("failed to generate verbs bindings");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_dir.join("fabric_bindings.rs"))
        .expect("failed to write verbs bindings");
}
