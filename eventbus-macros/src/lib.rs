use proc_macro::TokenStream;

mod integration_event;
mod utils;

/// 集成事件宏
/// - 仅支持具名字段结构体；
/// - 若缺失则在最前追加 `id: Uuid`（序列化为 `Id`）与 `creation_date: DateTime<Utc>`
///   （序列化为 `CreationDate`），可见性与结构体一致；
/// - 合并派生：`Debug, Clone, serde::Serialize, serde::Deserialize`；
/// - 实现 `::eventbus::IntegrationEvent`，事件名默认取结构体名；
/// - 两个信封字段均由宏追加时，生成 `new(其余字段...)`，自动生成标识并记录当前 UTC 时间。
///
/// 支持参数：
/// - `#[integration_event(name = "...")]` 覆写事件名（路由键）；
/// - `#[integration_event(constructor = false)]` 不生成 `new`。
#[proc_macro_attribute]
pub fn integration_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    integration_event::expand(attr, item)
}
