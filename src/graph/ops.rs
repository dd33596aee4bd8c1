//! Constructors for the op set understood by the local engine.

use crate::dtype::DType;
use crate::graph::proto::{AttrValue, TensorProto};
use crate::graph::shape::{Dimension, TensorShape};
use crate::graph::{Graph, GraphError, OpRef, TensorRef};
use crate::value::TensorValue;

pub fn placeholder(graph: &Graph, name: &str, dtype: DType, shape: TensorShape) -> Result<TensorRef, GraphError> {
    let op = graph
        .op_builder("Placeholder", name)
        .attr("dtype", AttrValue::dtype(dtype))
        .attr("shape", AttrValue::shape(shape.to_proto()))
        .output(dtype, shape)
        .build()?;
    Ok(op.output(0))
}

pub fn constant(graph: &Graph, name: &str, value: &TensorValue) -> Result<TensorRef, GraphError> {
    let op = graph
        .op_builder("Const", name)
        .attr("dtype", AttrValue::dtype(value.dtype()))
        .attr("value", AttrValue::tensor(TensorProto::from(value)))
        .output(value.dtype(), TensorShape::known(&value.shape()))
        .build()?;
    Ok(op.output(0))
}

/// A stateful node holding `initial` until it is assigned to.
pub fn variable(graph: &Graph, name: &str, initial: &TensorValue) -> Result<TensorRef, GraphError> {
    let shape = TensorShape::known(&initial.shape());
    let op = graph
        .op_builder("Variable", name)
        .attr("dtype", AttrValue::dtype(initial.dtype()))
        .attr("shape", AttrValue::shape(shape.to_proto()))
        .attr("value", AttrValue::tensor(TensorProto::from(initial)))
        .output(initial.dtype(), shape)
        .build()?;
    Ok(op.output(0))
}

fn variable_update(
    graph: &Graph,
    op_type: &str,
    name: &str,
    var: &TensorRef,
    value: &TensorRef,
) -> Result<TensorRef, GraphError> {
    let var_spec = graph.output_spec(var)?;
    let node = graph.node(var.op_name());
    if node.as_ref().map(|n| n.op_type()) != Some("Variable") {
        return Err(GraphError::InvalidArgument(format!(
            "{op_type} target '{var}' is not a Variable"
        )));
    }
    let value_spec = graph.output_spec(value)?;
    if value_spec.dtype != var_spec.dtype {
        return Err(GraphError::InvalidArgument(format!(
            "{op_type} '{name}' expects {} but got {}",
            var_spec.dtype, value_spec.dtype
        )));
    }
    let op = graph
        .op_builder(op_type, name)
        .input(var)
        .input(value)
        .output(var_spec.dtype, var_spec.shape)
        .build()?;
    Ok(op.output(0))
}

pub fn assign(graph: &Graph, name: &str, var: &TensorRef, value: &TensorRef) -> Result<TensorRef, GraphError> {
    variable_update(graph, "Assign", name, var, value)
}

pub fn assign_add(graph: &Graph, name: &str, var: &TensorRef, value: &TensorRef) -> Result<TensorRef, GraphError> {
    variable_update(graph, "AssignAdd", name, var, value)
}

fn broadcast_shape(a: &TensorShape, b: &TensorShape) -> TensorShape {
    let (Some(da), Some(db)) = (a.dims(), b.dims()) else {
        return TensorShape::unknown();
    };
    let rank = da.len().max(db.len());
    let pick = |dims: &[Dimension], i: usize| {
        let offset = rank - dims.len();
        if i < offset { Dimension::Known(1) } else { dims[i - offset] }
    };
    let dims = (0..rank)
        .map(|i| match (pick(da, i), pick(db, i)) {
            (Dimension::Known(1), d) | (d, Dimension::Known(1)) => d,
            (Dimension::Known(x), Dimension::Known(y)) if x == y => Dimension::Known(x),
            _ => Dimension::Unknown,
        })
        .collect();
    TensorShape::new(dims)
}

fn binary(graph: &Graph, op_type: &str, name: &str, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
    let sa = graph.output_spec(a)?;
    let sb = graph.output_spec(b)?;
    if sa.dtype != sb.dtype {
        return Err(GraphError::InvalidArgument(format!(
            "{op_type} '{name}' has mismatched input dtypes {} and {}",
            sa.dtype, sb.dtype
        )));
    }
    let op = graph
        .op_builder(op_type, name)
        .input(a)
        .input(b)
        .attr("T", AttrValue::dtype(sa.dtype))
        .output(sa.dtype, broadcast_shape(&sa.shape, &sb.shape))
        .build()?;
    Ok(op.output(0))
}

pub fn add(graph: &Graph, name: &str, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
    binary(graph, "Add", name, a, b)
}

pub fn sub(graph: &Graph, name: &str, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
    binary(graph, "Sub", name, a, b)
}

pub fn mul(graph: &Graph, name: &str, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
    binary(graph, "Mul", name, a, b)
}

pub fn identity(graph: &Graph, name: &str, input: &TensorRef) -> Result<TensorRef, GraphError> {
    let spec = graph.output_spec(input)?;
    let op = graph
        .op_builder("Identity", name)
        .input(input)
        .output(spec.dtype, spec.shape)
        .build()?;
    Ok(op.output(0))
}

/// An op with no outputs that runs after everything in `deps`.
pub fn no_op(graph: &Graph, name: &str, deps: &[OpRef]) -> Result<OpRef, GraphError> {
    deps.iter()
        .fold(graph.op_builder("NoOp", name), |b, d| b.control_input(d))
        .build()
}

/// Keeps `value` inside the engine and outputs a string handle to it. With no
/// `device` the node takes the current scope's default.
pub fn get_session_handle(
    graph: &Graph,
    name: &str,
    value: &TensorRef,
    device: Option<&str>,
) -> Result<TensorRef, GraphError> {
    let spec = graph.output_spec(value)?;
    let op = graph
        .op_builder("GetSessionHandle", name)
        .input(value)
        .maybe_device(device)
        .attr("dtype", AttrValue::dtype(spec.dtype))
        .output(DType::STRING, TensorShape::scalar())
        .build()?;
    Ok(op.output(0))
}

fn handle_holder(graph: &Graph, prefix: &str, shape: TensorShape, device: Option<&str>) -> Result<TensorRef, GraphError> {
    let op = graph
        .op_builder("Placeholder", &graph.unique_name(prefix))
        .maybe_device(device)
        .attr("dtype", AttrValue::dtype(DType::STRING))
        .attr("shape", AttrValue::shape(shape.to_proto()))
        .output(DType::STRING, shape)
        .build()?;
    Ok(op.output(0))
}

/// Returns `(holder, reader)`: feeding a handle string into `holder` makes
/// `reader` produce the value it refers to.
pub fn get_session_tensor(
    graph: &Graph,
    dtype: DType,
    device: Option<&str>,
) -> Result<(TensorRef, TensorRef), GraphError> {
    let holder = handle_holder(graph, "GetSessionTensor/handle", TensorShape::scalar(), device)?;
    let reader = graph
        .op_builder("GetSessionTensor", &graph.unique_name("GetSessionTensor"))
        .input(&holder)
        .maybe_device(device)
        .attr("dtype", AttrValue::dtype(dtype))
        .output(dtype, TensorShape::unknown())
        .build()?;
    graph.register_handle_feeder(holder.op_name(), dtype);
    Ok((holder, reader.output(0)))
}

/// Returns `(holder, deleter)`: running `deleter` with a 1-D string tensor fed
/// into `holder` releases every handle in it.
pub fn delete_session_tensor(graph: &Graph, device: Option<&str>) -> Result<(TensorRef, OpRef), GraphError> {
    let holder = handle_holder(
        graph,
        "DeleteSessionTensor/handle",
        TensorShape::new(vec![Dimension::Unknown]),
        device,
    )?;
    let deleter = graph
        .op_builder("DeleteSessionTensor", &graph.unique_name("DeleteSessionTensor"))
        .input(&holder)
        .maybe_device(device)
        .build()?;
    Ok((holder, deleter))
}
