//! 流式转发 + 用量统计
//!
//! 后台任务从适配器的事件流逐个读取：先写入有界队列（转发给 HTTP 写端），
//! 再检查事件累计用量；流结束时关闭队列，HTTP 响应随之结束。

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use tokio::sync::mpsc;

use super::response::{EventKind, EventStream, ResponseEvent};
use crate::bedrock::TokenCounts;
use crate::metering::UsageMeter;

/// 生产者与 HTTP 写端之间的队列容量
pub const TAP_QUEUE_CAPACITY: usize = 10;

/// 单个请求的用量状态机
///
/// - `message_start`：锁存输入 token（只接受第一个非零值）
/// - `message_delta`：输出 token 取观测到的最大值
/// - `message_stop` / `content_block_stop`：输入输出都大于 0 且未记录时触发一次
/// - `completion`：带 `stop_reason` 的最后一个事件按 invocationMetrics 触发
#[derive(Debug, Default)]
pub struct UsageTracker {
    input_tokens: i64,
    output_tokens: i64,
    recorded: bool,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_tokens(&self) -> i64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> i64 {
        self.output_tokens
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    /// 检查一个事件；返回 `Some` 表示此刻应计费，整个请求最多返回一次
    pub fn observe(&mut self, event: &ResponseEvent) -> Option<TokenCounts> {
        match event.kind {
            EventKind::MessageStart => {
                if let Some(input) = event.usage.and_then(|u| u.input_tokens) {
                    self.latch_input(input);
                }
                None
            }
            EventKind::MessageDelta => {
                if let Some(output) = event.usage.and_then(|u| u.output_tokens) {
                    self.raise_output(output);
                }
                None
            }
            // Messages 流只认 message_delta 上的输出 token，结束事件上的 invocationMetrics 不参与计费
            EventKind::MessageStop | EventKind::ContentBlockStop => self.fire(),
            EventKind::Completion => {
                self.absorb_metrics(event);
                if event.is_completion_stop() {
                    self.fire()
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn latch_input(&mut self, input: i64) {
        if self.input_tokens == 0 && input > 0 {
            self.input_tokens = input;
        }
    }

    fn raise_output(&mut self, output: i64) {
        self.output_tokens = self.output_tokens.max(output);
    }

    /// Text Completions 最后一个事件上的 invocationMetrics
    fn absorb_metrics(&mut self, event: &ResponseEvent) {
        if let Some(usage) = event.usage {
            if let Some(input) = usage.input_tokens {
                self.latch_input(input);
            }
            if let Some(output) = usage.output_tokens {
                self.raise_output(output);
            }
        }
    }

    fn fire(&mut self) -> Option<TokenCounts> {
        if self.recorded || self.input_tokens <= 0 || self.output_tokens <= 0 {
            return None;
        }
        self.recorded = true;
        Some(TokenCounts {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }
}

/// 计费需要的请求上下文
#[derive(Clone)]
pub struct MeterContext {
    pub meter: Arc<UsageMeter>,
    pub api_key_name: String,
    pub api_key_value: String,
    pub model_id: String,
}

/// 启动转发任务，返回 HTTP 写端消费的队列
pub fn spawn_tap(events: EventStream, ctx: MeterContext) -> mpsc::Receiver<ResponseEvent> {
    let (tx, rx) = mpsc::channel(TAP_QUEUE_CAPACITY);
    tokio::spawn(run_tap(events, tx, ctx));
    rx
}

async fn run_tap(mut events: EventStream, tx: mpsc::Sender<ResponseEvent>, ctx: MeterContext) {
    let mut tracker = UsageTracker::new();
    let mut client_gone = false;
    let mut forwarded = 0usize;

    while let Some(event) = events.next().await {
        let settle = tracker.observe(&event);

        if !client_gone {
            if tx.send(event).await.is_err() {
                // 客户端已断开：继续读完上游，保证连接正常释放
                tracing::warn!(model = %ctx.model_id, "客户端已断开，继续消费上游事件流");
                client_gone = true;
            } else {
                forwarded += 1;
            }
        }

        if let Some(counts) = settle {
            ctx.meter.settle(
                &ctx.api_key_name,
                &ctx.api_key_value,
                &ctx.model_id,
                counts.input_tokens,
                counts.output_tokens,
            );
        }
    }

    if !tracker.is_recorded() {
        tracing::warn!(
            model = %ctx.model_id,
            input_tokens = tracker.input_tokens(),
            output_tokens = tracker.output_tokens(),
            "流结束但未满足计费条件，本次请求不记录用量"
        );
    }
    tracing::debug!(model = %ctx.model_id, forwarded, "流式转发结束");
    // tx 在此处 drop，队列关闭
}

/// 队列 → SSE 字节流，每个事件一帧
pub fn sse_body(rx: mpsc::Receiver<ResponseEvent>) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(event.to_sse_frame()), rx))
    })
}
