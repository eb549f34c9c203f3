//! Just enough of the ONNX protobuf format to expose an intermediate
//! activation as an extra graph output.
//!
//! ```text
//! ModelProto {
//!   graph: GraphProto              (field 7)
//!     node: [NodeProto]            (field 1, repeated)
//!       input: [string]            (field 1)
//!       output: [string]           (field 2)
//!       name: string               (field 3)
//!       op_type: string            (field 4)
//!     output: [ValueInfoProto]     (field 12, repeated)
//!       name: string               (field 1)
//! }
//! ```
//!
//! Protobuf merges repeated occurrences of an embedded message, so a model
//! gains an output by appending a second `graph` field that only carries the
//! new `ValueInfoProto`. The rest of the file is left untouched.

use crate::classifier::ClassifierError;

const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

const MODEL_GRAPH: u32 = 7;
const GRAPH_NODE: u32 = 1;
const GRAPH_OUTPUT: u32 = 12;
const NODE_OUTPUT: u32 = 2;
const NODE_NAME: u32 = 3;
const NODE_OP_TYPE: u32 = 4;
const VALUE_INFO_NAME: u32 = 1;

fn malformed(message: impl Into<String>) -> ClassifierError {
    ClassifierError::ModelLoad(format!("Malformed ONNX model: {}", message.into()))
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphNode {
    pub name: String,
    pub op_type: String,
    pub outputs: Vec<String>,
}

/// Node list and declared outputs of a model graph.
#[derive(Debug, Clone, Default)]
pub struct ModelGraph {
    nodes: Vec<GraphNode>,
    outputs: Vec<String>,
}

impl ModelGraph {
    pub fn parse(model: &[u8]) -> Result<Self, ClassifierError> {
        let mut graph = Self::default();
        let mut reader = ProtobufReader::new(model);
        while reader.has_more() {
            match reader.read_tag()? {
                (MODEL_GRAPH, WIRE_LEN) => graph.merge(reader.read_bytes()?)?,
                (_, wire_type) => reader.skip_field(wire_type)?,
            }
        }
        Ok(graph)
    }

    fn merge(&mut self, data: &[u8]) -> Result<(), ClassifierError> {
        let mut reader = ProtobufReader::new(data);
        while reader.has_more() {
            match reader.read_tag()? {
                (GRAPH_NODE, WIRE_LEN) => self.nodes.push(Self::parse_node(reader.read_bytes()?)?),
                (GRAPH_OUTPUT, WIRE_LEN) => self.outputs.push(Self::parse_value_info(reader.read_bytes()?)?),
                (_, wire_type) => reader.skip_field(wire_type)?,
            }
        }
        Ok(())
    }

    fn parse_node(data: &[u8]) -> Result<GraphNode, ClassifierError> {
        let mut node = GraphNode::default();
        let mut reader = ProtobufReader::new(data);
        while reader.has_more() {
            match reader.read_tag()? {
                (NODE_OUTPUT, WIRE_LEN) => node.outputs.push(reader.read_string()?),
                (NODE_NAME, WIRE_LEN) => node.name = reader.read_string()?,
                (NODE_OP_TYPE, WIRE_LEN) => node.op_type = reader.read_string()?,
                (_, wire_type) => reader.skip_field(wire_type)?,
            }
        }
        Ok(node)
    }

    fn parse_value_info(data: &[u8]) -> Result<String, ClassifierError> {
        let mut name = String::new();
        let mut reader = ProtobufReader::new(data);
        while reader.has_more() {
            match reader.read_tag()? {
                (VALUE_INFO_NAME, WIRE_LEN) => name = reader.read_string()?,
                (_, wire_type) => reader.skip_field(wire_type)?,
            }
        }
        Ok(name)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// First output of the last node with the given op type, in graph order.
    pub fn last_output_of(&self, op_type: &str) -> Option<&str> {
        self.nodes
            .iter()
            .rev()
            .find(|node| node.op_type == op_type)
            .and_then(|node| node.outputs.first())
            .map(String::as_str)
    }
}

/// Returns `model` with `name` declared as an additional graph output.
///
/// The value keeps no type information; ONNX Runtime infers it from the
/// producing node. A name that is already an output is left alone.
pub fn expose_output(model: &[u8], name: &str) -> Result<Vec<u8>, ClassifierError> {
    let graph = ModelGraph::parse(model)?;
    if graph.outputs().iter().any(|output| output == name) {
        return Ok(model.to_vec());
    }
    if !graph.nodes().iter().any(|node| node.outputs.iter().any(|o| o == name)) {
        return Err(malformed(format!("no node produces '{}'", name)));
    }

    let value_info = len_field(VALUE_INFO_NAME, name.as_bytes());
    let graph_patch = len_field(GRAPH_OUTPUT, &value_info);
    let mut patched = Vec::with_capacity(model.len() + graph_patch.len() + 8);
    patched.extend_from_slice(model);
    patched.extend_from_slice(&len_field(MODEL_GRAPH, &graph_patch));
    Ok(patched)
}

fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn len_field(field: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    put_varint(&mut out, u64::from(field << 3 | WIRE_LEN));
    put_varint(&mut out, payload.len() as u64);
    out.extend_from_slice(payload);
    out
}

struct ProtobufReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtobufReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn has_more(&self) -> bool {
        self.pos < self.data.len()
    }

    fn read_tag(&mut self) -> Result<(u32, u32), ClassifierError> {
        let tag = self.read_varint()?;
        Ok(((tag >> 3) as u32, (tag & 0x7) as u32))
    }

    fn read_varint(&mut self) -> Result<u64, ClassifierError> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| malformed("unexpected end of data"))?;
            self.pos += 1;
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(malformed("varint overflow"));
            }
        }
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], ClassifierError> {
        let len = self.read_varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| malformed("length-delimited field runs past the end"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String, ClassifierError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid UTF-8 in string"))
    }

    fn skip(&mut self, len: usize) -> Result<(), ClassifierError> {
        if self.pos + len > self.data.len() {
            return Err(malformed("fixed-width field runs past the end"));
        }
        self.pos += len;
        Ok(())
    }

    fn skip_field(&mut self, wire_type: u32) -> Result<(), ClassifierError> {
        match wire_type {
            WIRE_VARINT => self.read_varint().map(|_| ()),
            WIRE_FIXED64 => self.skip(8),
            WIRE_LEN => self.read_bytes().map(|_| ()),
            WIRE_FIXED32 => self.skip(4),
            other => Err(malformed(format!("unsupported wire type {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, op_type: &str, input: &str, output: &str) -> Vec<u8> {
        let mut out = len_field(1, input.as_bytes());
        out.extend(len_field(NODE_OUTPUT, output.as_bytes()));
        out.extend(len_field(NODE_NAME, name.as_bytes()));
        out.extend(len_field(NODE_OP_TYPE, op_type.as_bytes()));
        out
    }

    /// conv -> pool -> flatten -> gemm, with "logits" as the only output
    fn tiny_model() -> Vec<u8> {
        let mut graph = Vec::new();
        for (name, op, input, output) in [
            ("conv", "Conv", "input", "features"),
            ("pool", "GlobalAveragePool", "features", "pooled"),
            ("flatten", "Flatten", "pooled", "flat"),
            ("fc", "Gemm", "flat", "logits"),
        ] {
            graph.extend(len_field(GRAPH_NODE, &node(name, op, input, output)));
        }
        graph.extend(len_field(GRAPH_OUTPUT, &len_field(VALUE_INFO_NAME, b"logits")));

        // ir_version, producer_name, graph
        let mut model = vec![0x08, 0x07];
        model.extend(len_field(2, b"glimpse-test"));
        model.extend(len_field(MODEL_GRAPH, &graph));
        model
    }

    #[test]
    fn test_parse_nodes_and_outputs() {
        let graph = ModelGraph::parse(&tiny_model()).unwrap();
        assert_eq!(graph.nodes().len(), 4);
        assert_eq!(graph.nodes()[1].op_type, "GlobalAveragePool");
        assert_eq!(graph.outputs(), &["logits".to_string()]);
        assert_eq!(graph.last_output_of("GlobalAveragePool"), Some("pooled"));
        assert_eq!(graph.last_output_of("Softmax"), None);
    }

    #[test]
    fn test_expose_output_appends_graph_output() {
        let model = tiny_model();
        let patched = expose_output(&model, "pooled").unwrap();
        assert!(patched.starts_with(&model));

        let graph = ModelGraph::parse(&patched).unwrap();
        assert_eq!(graph.outputs(), &["logits".to_string(), "pooled".to_string()]);
        assert_eq!(graph.nodes().len(), 4);

        // Idempotent for names that are already outputs
        assert_eq!(expose_output(&patched, "pooled").unwrap(), patched);
    }

    #[test]
    fn test_expose_unknown_tensor() {
        let result = expose_output(&tiny_model(), "missing");
        assert!(matches!(result, Err(ClassifierError::ModelLoad(_))));
    }

    #[test]
    fn test_truncated_model_is_rejected() {
        let model = tiny_model();
        let result = ModelGraph::parse(&model[..model.len() - 3]);
        assert!(matches!(result, Err(ClassifierError::ModelLoad(_))));
    }

    #[test]
    fn test_long_varint_lengths() {
        let name = "n".repeat(300);
        let field = len_field(VALUE_INFO_NAME, name.as_bytes());
        // 300 needs a two-byte varint
        assert_eq!(field.len(), 1 + 2 + 300);
        assert_eq!(ModelGraph::parse_value_info(&field).unwrap(), name);
    }
}
