use eventbus::IntegrationEvent;
use eventbus_macros::integration_event;

#[integration_event(name = "stock.reserved")]
#[derive(PartialEq)]
pub struct StockReserved {
    pub sku: String,
    pub quantity: u32,
}

fn main() {
    assert_eq!(StockReserved::EVENT_NAME, "stock.reserved");
    let ev = StockReserved::new("A-1".into(), 2);
    assert_eq!(ev.clone(), ev);
}
