fn main() {
    println!("cargo:rerun-if-changed=protos/peering.proto");
    println!("cargo:rerun-if-changed=protos/info.proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["protos/peering.proto", "protos/info.proto"], &["./protos"])
        .expect("failed to compile gRPC definitions");
}
