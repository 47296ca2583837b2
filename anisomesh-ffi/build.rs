use std::{env, path::PathBuf};

fn main() {
    // The header is written next to libanisomesh.so, i.e. in target/<profile>
    let mut out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    for _ in 0..3 {
        out_path.pop();
    }
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    println!("cargo:rerun-if-changed=src");
    cbindgen::Builder::new()
        .with_crate(crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("ANISOMESH_H")
        .generate()
        .expect("Unable to generate the C header")
        .write_to_file(out_path.join("anisomesh.h"));
}
