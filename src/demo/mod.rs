//! Demo services: the server exposes `Greeter`, connected clients expose
//! `Namer`, and greeting a client asks that same client for its name.

use std::{pin::Pin, sync::Arc};

use futures_util::Stream;
use tonic::{transport::Channel, Request, Response, Status};

use crate::server::{Server, ServerOptions};

include!(concat!(env!("OUT_DIR"), "/brpc.demo.Greeter.rs"));
include!(concat!(env!("OUT_DIR"), "/brpc.demo.Namer.rs"));

use greeter_server::Greeter;
use namer_client::NamerClient;
use namer_server::Namer;

/// Upper bound on replies to one `GreetMany` call.
pub const MAX_GREETINGS: u32 = 100;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GreetRequest {
    #[prost(string, tag = "1")]
    pub greeting: String,
    /// Number of replies for `GreetMany`; ignored by `Greet`.
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GreetReply {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(uint32, tag = "2")]
    pub seq: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NameRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NameReply {
    #[prost(string, tag = "1")]
    pub name: String,
}

pub type DemoServer = Server<NamerClient<Channel>>;

/// A server whose callback proxies are `Namer` clients.
pub fn new_server(span: tracing::Span) -> Arc<DemoServer> {
    Server::new(ServerOptions::new(NamerClient::new).with_span(span))
}

fn message(greeting: &str, name: &str) -> String {
    let greeting = greeting.trim();
    let greeting = if greeting.is_empty() { "Hello" } else { greeting };
    format!("{greeting}, {name}!")
}

pub struct DemoGreeter {
    server: Arc<DemoServer>,
}

impl DemoGreeter {
    pub fn new(server: Arc<DemoServer>) -> Self {
        Self { server }
    }

    async fn caller_name<T>(&self, req: &Request<T>) -> Result<String, Status> {
        let mut namer = self.server.client_from_request(req)?;
        let reply = namer.name(NameRequest {}).await?;
        Ok(reply.into_inner().name)
    }
}

#[tonic::async_trait]
impl Greeter for DemoGreeter {
    async fn greet(&self, req: Request<GreetRequest>) -> Result<Response<GreetReply>, Status> {
        let name = self.caller_name(&req).await?;
        tracing::debug!(name = %name, "demo: greeting");
        Ok(Response::new(GreetReply {
            message: message(&req.get_ref().greeting, &name),
            seq: 0,
        }))
    }

    type GreetManyStream = Pin<Box<dyn Stream<Item = Result<GreetReply, Status>> + Send>>;

    async fn greet_many(
        &self,
        req: Request<GreetRequest>,
    ) -> Result<Response<Self::GreetManyStream>, Status> {
        let name = self.caller_name(&req).await?;
        let count = req.get_ref().count.clamp(1, MAX_GREETINGS);
        let text = message(&req.get_ref().greeting, &name);
        let replies = (0..count).map(move |seq| {
            Ok(GreetReply {
                message: text.clone(),
                seq,
            })
        });
        Ok(Response::new(Box::pin(futures_util::stream::iter(replies))))
    }
}

/// Answers the server's callbacks with a fixed name.
pub struct DemoNamer {
    name: String,
}

impl DemoNamer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[tonic::async_trait]
impl Namer for DemoNamer {
    async fn name(&self, _req: Request<NameRequest>) -> Result<Response<NameReply>, Status> {
        Ok(Response::new(NameReply {
            name: self.name.clone(),
        }))
    }
}
