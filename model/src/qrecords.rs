use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pt::flow::ColumnDescriptor;
use tokio::sync::mpsc;
use value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QRecordSchema {
    pub fields: Vec<ColumnDescriptor>,
}

impl QRecordSchema {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QRecord {
    pub values: Vec<Value>,
}

/// An in-memory batch of rows pulled for one partition.
#[derive(Debug, Clone)]
pub struct QRecordBatch {
    pub schema: QRecordSchema,
    pub records: Vec<QRecord>,
}

impl QRecordBatch {
    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    /// Converts into a lazy single-pass stream, buffered at `buffer`
    /// records. The batch is consumed; the stream cannot be restarted.
    pub fn into_stream(self, buffer: usize) -> QRecordStream {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let schema = self.schema.clone();
        tokio::spawn(async move {
            for record in self.records {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        QRecordStream { schema, rx }
    }
}

/// Lazy, finite, single-pass stream of rows feeding a partition sync.
pub struct QRecordStream {
    schema: QRecordSchema,
    rx: mpsc::Receiver<QRecord>,
}

impl QRecordStream {
    pub fn new(schema: QRecordSchema, buffer: usize) -> (mpsc::Sender<QRecord>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { schema, rx })
    }

    pub fn schema(&self) -> &QRecordSchema {
        &self.schema
    }

    pub async fn next_record(&mut self) -> Option<QRecord> {
        self.rx.recv().await
    }
}

impl Stream for QRecordStream {
    type Item = QRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use value::Kind;

    fn schema() -> QRecordSchema {
        QRecordSchema {
            fields: vec![ColumnDescriptor {
                name: "id".to_string(),
                kind: Kind::Int64,
                nullable: false,
            }],
        }
    }

    #[tokio::test]
    async fn stream_yields_records_in_order() {
        let batch = QRecordBatch {
            schema: schema(),
            records: (0..10)
                .map(|i| QRecord {
                    values: vec![Value::big_int(i)],
                })
                .collect(),
        };
        let mut stream = batch.into_stream(4);
        let mut seen = Vec::new();
        while let Some(rec) = stream.next_record().await {
            seen.push(rec.values[0].clone());
        }
        let expected: Vec<Value> = (0..10).map(Value::big_int).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn stream_is_finite() {
        let batch = QRecordBatch {
            schema: schema(),
            records: Vec::new(),
        };
        let mut stream = batch.into_stream(1024);
        assert!(stream.next_record().await.is_none());
    }
}
