use actix::dev::MessageResponse;
use actix::prelude::*;
use async_trait::async_trait;
use tracing::Span;

/// Message with span used for trace logging
pub struct SpanMessage<I> {
    pub msg: I,
    pub span: Span,
}

impl<M> SpanMessage<M> {
    pub fn new(msg: M) -> Self {
        Self {
            msg,
            span: Span::current(),
        }
    }

    pub fn with_span(msg: M, span: Span) -> Self {
        Self { msg, span }
    }
}

impl<M, R: 'static> Message for SpanMessage<M>
where
    M: Message<Result = R>,
{
    type Result = R;
}

pub trait SpanHandler<M>
where
    Self: Actor,
    M: Message,
{
    /// The type of value that this handler will return.
    type Result: MessageResponse<Self, SpanMessage<M>>;

    /// This method is called for every message received by this actor.
    fn handle(&mut self, msg: M, ctx: &mut Self::Context, span: Span) -> Self::Result;
}

#[async_trait]
pub trait AsyncSpanHandler<M>
where
    Self: Actor,
    M: Message,
{
    async fn handle(msg: M) -> <M as Message>::Result;
}

#[macro_export]
macro_rules! span_message_impl {
    ($message_type:ident, $actor:ident) => {
        impl Handler<$crate::span::SpanMessage<$message_type>> for $actor {
            type Result = <Self as $crate::span::SpanHandler<$message_type>>::Result;
            fn handle(
                &mut self,
                msg: $crate::span::SpanMessage<$message_type>,
                ctx: &mut Context<Self>,
            ) -> Self::Result {
                let $crate::span::SpanMessage { span, msg } = msg;
                let _enter = span.enter();
                <Self as $crate::span::SpanHandler<$message_type>>::handle(self, msg, ctx, span.clone())
            }
        }
    };
}

#[macro_export]
macro_rules ! message_handler_with_span {
    (impl SpanHandler<$M:ident> for $A:ident $t:tt) => {
        $crate::span_message_impl!($M, $A);
        impl $crate::span::SpanHandler<$M> for $A
            $t

    }
}

#[macro_export]
macro_rules! span_message_async_impl {
    ($message_type:ident, $actor:ident) => {
        impl Handler<$crate::span::SpanMessage<$message_type>> for $actor {
            type Result = ResponseActFuture<Self, <$message_type as Message>::Result>;
            fn handle(
                &mut self,
                msg: $crate::span::SpanMessage<$message_type>,
                _ctx: &mut Context<Self>,
            ) -> Self::Result {
                use actix_interop::FutureInterop;
                use tracing_futures::Instrument;
                let $crate::span::SpanMessage { span, msg } = msg;
                <Self as $crate::span::AsyncSpanHandler<$message_type>>::handle(msg)
                    .instrument(span)
                    .interop_actor_boxed(self)
            }
        }
    };
}

#[macro_export]
macro_rules ! async_message_handler_with_span {
    (impl AsyncSpanHandler<$M:ident> for $A:ident $t:tt) => {
        $crate::span_message_async_impl!($M, $A);
        #[async_trait::async_trait]
        impl $crate::span::AsyncSpanHandler<$M> for $A
            $t

    }
}
