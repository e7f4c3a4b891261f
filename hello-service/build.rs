use std::env::var;
use std::io::Result;

fn main() -> Result<()> {
    let proto_files = &["proto/hello.proto"];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";
    let out_dir = var("OUT_DIR").expect("Missing OUT_DIR environment variable");
    let descriptors_path = format!("{}/descriptors.bin", out_dir);

    tonic_prost_build::configure()
        .file_descriptor_set_path(descriptors_path)
        .build_client(false)
        .compile_protos(proto_files, &[proto_folder])
        .unwrap();

    Ok(())
}
