// Demo services used by the reference CLI and the end-to-end tests.
//
// Built with tonic-build's manual service definitions so no protoc install is
// needed; message types are hand-written prost structs in `src/demo/mod.rs`.

fn main() {
    let greeter = tonic_build::manual::Service::builder()
        .name("Greeter")
        .package("brpc.demo")
        .method(
            tonic_build::manual::Method::builder()
                .name("greet")
                .route_name("Greet")
                .input_type("crate::demo::GreetRequest")
                .output_type("crate::demo::GreetReply")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .method(
            tonic_build::manual::Method::builder()
                .name("greet_many")
                .route_name("GreetMany")
                .input_type("crate::demo::GreetRequest")
                .output_type("crate::demo::GreetReply")
                .codec_path("tonic::codec::ProstCodec")
                .server_streaming()
                .build(),
        )
        .build();

    let namer = tonic_build::manual::Service::builder()
        .name("Namer")
        .package("brpc.demo")
        .method(
            tonic_build::manual::Method::builder()
                .name("name")
                .route_name("Name")
                .input_type("crate::demo::NameRequest")
                .output_type("crate::demo::NameReply")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[greeter, namer]);
}
