fn main() {
    // Parse the protobuf schema with the pure-Rust `protox` compiler so the
    // build does not depend on a system `protoc` binary, then hand the
    // resulting descriptor set to prost-build for code generation.
    let file_descriptors = protox::compile(["src/proto/session.proto"], ["src"])
        .expect("Protobufs in src are valid");

    let mut prost_build = prost_build::Config::new();
    prost_build
        .compile_fds(file_descriptors)
        .expect("Protobuf descriptors compile");
}
