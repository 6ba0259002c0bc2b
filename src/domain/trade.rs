use crate::object_store_sink::general::ToArrow;
use crate::record::{FieldValue, Record};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use fake::{faker, Fake};
use rand::{random, Rng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub side: String,
    pub market: String,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// json payload plus the fields matching [`Trade::schema`], keyed by the trade id
    pub fn to_record(&self) -> Record {
        let payload = serde_json::to_vec(self).unwrap_or_default();
        Record::new(payload, self.to_fields()).with_correlation_id(self.id.clone())
    }
}

impl ToArrow for Trade {
    fn schema() -> Schema {
        let fields = vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("side", DataType::Utf8, false),
            Field::new("market", DataType::Utf8, false),
            Field::new("price", DataType::Float64, false),
            Field::new("size", DataType::Float64, false),
            Field::new(
                "timestamp",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ];
        Schema::new(fields)
    }

    fn to_fields(&self) -> Vec<FieldValue> {
        vec![
            FieldValue::Utf8(self.id.clone()),
            FieldValue::Utf8(self.side.clone()),
            FieldValue::Utf8(self.market.clone()),
            FieldValue::Float64(self.price),
            FieldValue::Float64(self.size),
            FieldValue::Timestamp(self.timestamp),
        ]
    }
}

pub fn get_test_trade(id: u32) -> Trade {
    let mut rng = rand::thread_rng();
    let side = if random() { "BUY" } else { "SELL" };
    let base: String = faker::currency::en::CurrencyCode().fake();

    Trade {
        id: id.to_string(),
        side: side.to_string(),
        market: format!("{}_USD", base),
        price: rng.gen_range(1.0..100_000.0),
        size: rng.gen_range(0.001..10.0),
        timestamp: Utc::now(),
    }
}
