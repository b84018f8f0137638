//! Backward traversal of the computation graph.

use super::GraphNode;
use crate::tensor::Result;
use std::collections::HashSet;
use std::rc::Rc;

/// Runs every node reachable from `root` in reverse topological order.
///
/// Nodes are identified by the data pointer of their `Rc`, which is stable for the lifetime
/// of the graph. The sort is iterative: an unroll of a recurrent optimizer easily produces
/// graphs deep enough to overflow the stack with a recursive walk.
///
/// # Errors
///
/// Stops at and returns the first error raised by a node.
pub fn backward(root: Option<Rc<dyn GraphNode>>) -> Result<()> {
    let Some(root) = root else { return Ok(()) };

    for node in topological_order(root).into_iter().rev() {
        node.backward()?;
    }
    Ok(())
}

/// Post-order DFS: every node appears after all of its parents.
fn topological_order(root: Rc<dyn GraphNode>) -> Vec<Rc<dyn GraphNode>> {
    let mut topo = Vec::new();
    let mut visited: HashSet<*const ()> = HashSet::new();
    // (node, parents already expanded)
    let mut stack: Vec<(Rc<dyn GraphNode>, bool)> = vec![(root, false)];

    while let Some((node, expanded)) = stack.pop() {
        let ptr = Rc::as_ptr(&node) as *const ();
        if expanded {
            topo.push(node);
            continue;
        }
        if !visited.insert(ptr) {
            continue;
        }
        let parents = node.parents();
        stack.push((node, true));
        for parent in parents {
            if !visited.contains(&(Rc::as_ptr(&parent) as *const ())) {
                stack.push((parent, false));
            }
        }
    }
    topo
}
