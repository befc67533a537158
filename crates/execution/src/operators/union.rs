use std::sync::Arc;

use arrow_schema::{Field, Schema, SchemaRef};
use fq_common::{FqError, Result};

use crate::block::{Block, batch_with_columns};
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

/// Reads its inputs one after another. No order is promised across inputs.
pub(crate) struct UnionOp {
    inputs: Vec<BatchStream>,
    current: usize,
    header: SchemaRef,
    concat: bool,
}

impl Operator for UnionOp {
    fn name(&self) -> &'static str {
        if self.concat { "Concat" } else { "Union" }
    }

    fn read(&mut self) -> Result<Option<Block>> {
        while self.current < self.inputs.len() {
            match self.inputs[self.current].next()? {
                Some(block) => {
                    if block.batch.schema() == self.header {
                        return Ok(Some(block));
                    }
                    let rows = block.num_rows();
                    let columns = block.batch.columns().to_vec();
                    let batch = batch_with_columns(self.header.clone(), columns, rows)?;
                    return Ok(Some(block.map_batch(batch)));
                }
                None => self.current += 1,
            }
        }
        Ok(None)
    }

    fn children(&self) -> Vec<&BatchStream> {
        self.inputs.iter().collect()
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        self.inputs.iter_mut().collect()
    }

    fn describe(&self) -> String {
        format!("inputs={}", self.inputs.len())
    }
}

/// Header shared by all inputs: names from the first, columns matched by
/// position, nullable where any input is.
fn common_header(inputs: &[BatchStream]) -> Result<SchemaRef> {
    let first = inputs
        .first()
        .map(BatchStream::schema)
        .ok_or_else(|| FqError::Planning("union of zero streams".to_string()))?;
    let mut nullable = first.fields().iter().map(|f| f.is_nullable()).collect::<Vec<_>>();
    for input in &inputs[1..] {
        let schema = input.schema();
        if schema.fields().len() != first.fields().len() {
            return Err(FqError::Planning(format!(
                "union of streams with different number of columns: {} and {}",
                first.fields().len(),
                schema.fields().len()
            )));
        }
        for (idx, (a, b)) in first.fields().iter().zip(schema.fields()).enumerate() {
            if a.data_type() != b.data_type() {
                return Err(FqError::Planning(format!(
                    "union column {} has type {:?} in one stream and {:?} in another",
                    a.name(),
                    a.data_type(),
                    b.data_type()
                )));
            }
            nullable[idx] |= b.is_nullable();
        }
    }
    Ok(Arc::new(Schema::new(
        first
            .fields()
            .iter()
            .zip(nullable)
            .map(|(f, n)| Field::new(f.name(), f.data_type().clone(), n))
            .collect::<Vec<_>>(),
    )))
}

impl BatchStream {
    /// Merges streams of one structure into one stream.
    pub fn union(inputs: Vec<BatchStream>) -> Result<Self> {
        Self::union_impl(inputs, false)
    }

    /// Like [`BatchStream::union`], but reads the inputs strictly in order.
    pub fn concat(inputs: Vec<BatchStream>) -> Result<Self> {
        Self::union_impl(inputs, true)
    }

    fn union_impl(inputs: Vec<BatchStream>, concat: bool) -> Result<Self> {
        let header = common_header(&inputs)?;
        Ok(Self::from_kind(
            StreamKind::Union(UnionOp {
                inputs,
                current: 0,
                header: header.clone(),
                concat,
            }),
            header,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::DataType;

    fn source(name: &str, nullable: bool, values: Vec<i64>) -> BatchStream {
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, nullable)]));
        let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))])
            .expect("batch");
        BatchStream::memory(schema, vec![batch])
    }

    #[test]
    fn union_relabels_to_the_first_header() {
        let mut s = BatchStream::union(vec![
            source("a", false, vec![1]),
            source("b", true, vec![2, 3]),
        ])
        .expect("union");
        let header = s.schema();
        assert_eq!(header.field(0).name(), "a");
        assert!(header.field(0).is_nullable());
        let out = s.collect().expect("collect");
        assert_eq!(out.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
        assert!(out.iter().all(|b| b.schema() == header));
    }

    #[test]
    fn union_rejects_different_structure() {
        let wide = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, false),
        ]));
        assert!(BatchStream::union(vec![source("a", false, vec![1]), BatchStream::null(wide)]).is_err());
        let text = Arc::new(Schema::new(vec![Field::new("a", DataType::Utf8, false)]));
        assert!(BatchStream::concat(vec![source("a", false, vec![1]), BatchStream::null(text)]).is_err());
    }

    #[test]
    fn union_merges_the_extremes_of_every_input() {
        let mut inputs = vec![
            source("a", false, vec![5, 9]),
            source("a", false, vec![-3, 4]),
            source("a", false, vec![7]),
        ];
        inputs.iter_mut().for_each(BatchStream::enable_extremes);
        let mut s = BatchStream::union(inputs).expect("union");
        s.collect().expect("collect");

        let ex = s.extremes().expect("extremes").expect("some");
        let values = ex.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!((values.value(0), values.value(1)), (-3, 9));
    }
}
