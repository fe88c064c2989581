//! Generates the `echo` and `file` test services.
//!
//! The descriptors are built in code so the build does not need `protoc`.
//! They mirror:
//!
//! ```proto
//! package echo;
//! message CallRequest { string name = 1; }
//! message CallResponse { string msg = 1; }
//! service Streams {
//!   rpc Call(CallRequest) returns (CallResponse);
//!   rpc AuthorizedCall(CallRequest) returns (CallResponse);
//!   rpc Echo(stream CallRequest) returns (stream CallResponse);
//! }
//!
//! package file;
//! message FileChunk { bytes content = 1; }
//! message UploadResponse { int64 size = 1; bool success = 2; }
//! service FileService {
//!   rpc Upload(stream FileChunk) returns (UploadResponse);
//! }
//! ```

use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto,
    ServiceDescriptorProto,
};

fn field(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_owned()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        json_name: Some(name.to_owned()),
        ..FieldDescriptorProto::default()
    }
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_owned()),
        field: fields,
        ..DescriptorProto::default()
    }
}

fn rpc(name: &str, input: &str, output: &str, client_streaming: bool, server_streaming: bool) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_owned()),
        input_type: Some(input.to_owned()),
        output_type: Some(output.to_owned()),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        ..MethodDescriptorProto::default()
    }
}

fn file(name: &str, package: &str, messages: Vec<DescriptorProto>, service: ServiceDescriptorProto) -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some(name.to_owned()),
        package: Some(package.to_owned()),
        syntax: Some("proto3".to_owned()),
        message_type: messages,
        service: vec![service],
        ..FileDescriptorProto::default()
    }
}

fn echo() -> FileDescriptorProto {
    file(
        "echo.proto",
        "echo",
        vec![
            message("CallRequest", vec![field("name", 1, Type::String)]),
            message("CallResponse", vec![field("msg", 1, Type::String)]),
        ],
        ServiceDescriptorProto {
            name: Some("Streams".to_owned()),
            method: vec![
                rpc("Call", ".echo.CallRequest", ".echo.CallResponse", false, false),
                rpc("AuthorizedCall", ".echo.CallRequest", ".echo.CallResponse", false, false),
                rpc("Echo", ".echo.CallRequest", ".echo.CallResponse", true, true),
            ],
            ..ServiceDescriptorProto::default()
        },
    )
}

fn upload() -> FileDescriptorProto {
    file(
        "file.proto",
        "file",
        vec![
            message("FileChunk", vec![field("content", 1, Type::Bytes)]),
            message(
                "UploadResponse",
                vec![field("size", 1, Type::Int64), field("success", 2, Type::Bool)],
            ),
        ],
        ServiceDescriptorProto {
            name: Some("FileService".to_owned()),
            method: vec![rpc("Upload", ".file.FileChunk", ".file.UploadResponse", true, false)],
            ..ServiceDescriptorProto::default()
        },
    )
}

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    orbkit_codegen::configure().compile_fds(FileDescriptorSet {
        file: vec![echo(), upload()],
    })
}
