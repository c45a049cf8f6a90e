//! guildcast-core
//!
//! アラートを全テナント（guild）へ「受信者ごとにちょうど 1 回」届けるための土台。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, dispatch, errors, decision, events）
//! - **ports**: 抽象化レイヤー（ledgers, resolver, delivery channel, clock, ids, events）
//! - **queue**: retry/dead-letter 付きのタスクキュー（TaskQueue trait + in-memory 実装）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, ParameterCodec）
//! - **app**: アプリケーション層（builder, runtime, worker, alerts）
//! - **impls**: ports の開発用・テスト用実装
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;
