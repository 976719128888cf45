use serde_json::Map;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::error::{PipelineError, Result};
use crate::value::Value;

/// Lista ordenada de nombres de campo, sin repetidos.
#[derive(Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(fields.len());
        for (pos, name) in fields.iter().enumerate() {
            if index.insert(name.clone(), pos).is_some() {
                return Err(PipelineError::DuplicateField(name.clone()));
            }
        }
        Ok(Self { fields, index })
    }

    /// Igual que [`Schema::new`] pero ya envuelto en `Arc`, que es como
    /// lo comparten las tuplas.
    pub fn shared<I, S>(fields: I) -> Result<Arc<Self>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(fields).map(Arc::new)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Posición de `name`, o `FieldNotFound`.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| PipelineError::FieldNotFound {
                field: name.to_string(),
                schema: self.to_string(),
            })
    }

    /// Posiciones de varios campos, en el orden pedido.
    pub fn positions<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.index_of(n.as_ref())).collect()
    }

    /// Campos de `self` seguidos de los de `other`.
    pub fn concat(&self, other: &Schema) -> Result<Schema> {
        Schema::new(self.fields.iter().chain(other.fields.iter()).cloned())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join(", "))
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.fields).finish()
    }
}

/// Forma de referirse a un campo: por posición o por nombre.
pub trait FieldRef: fmt::Display {
    fn resolve(&self, schema: &Schema, len: usize) -> Result<usize>;
}

impl FieldRef for usize {
    fn resolve(&self, _schema: &Schema, len: usize) -> Result<usize> {
        if *self < len {
            Ok(*self)
        } else {
            Err(PipelineError::IndexOutOfRange { index: *self, len })
        }
    }
}

impl FieldRef for str {
    fn resolve(&self, schema: &Schema, _len: usize) -> Result<usize> {
        schema.index_of(self)
    }
}

impl FieldRef for String {
    fn resolve(&self, schema: &Schema, _len: usize) -> Result<usize> {
        schema.index_of(self)
    }
}

/// Registro inmutable. Clonar es barato: esquema y valores van en `Arc`.
#[derive(Clone)]
pub struct Tuple {
    schema: Arc<Schema>,
    values: Arc<[Value]>,
}

impl Tuple {
    /// Falla con `SchemaArityMismatch` si la cantidad de valores no coincide.
    pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(PipelineError::SchemaArityMismatch {
                expected: schema.len(),
                found: values.len(),
            });
        }
        Ok(Self::from_parts(schema, values))
    }

    /// Sin validación; sólo para valores cuyo largo ya se comprobó.
    pub(crate) fn from_parts(schema: Arc<Schema>, values: Vec<Value>) -> Self {
        Self {
            schema,
            values: values.into(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get<F: FieldRef>(&self, field: F) -> Result<&Value> {
        let pos = field.resolve(&self.schema, self.values.len())?;
        Ok(&self.values[pos])
    }

    pub fn get_str<F: FieldRef>(&self, field: F) -> Result<&str> {
        let v = self.get(&field)?;
        v.as_str().ok_or_else(|| mismatch(&field, "str", v))
    }

    pub fn get_int<F: FieldRef>(&self, field: F) -> Result<i64> {
        let v = self.get(&field)?;
        v.as_int().ok_or_else(|| mismatch(&field, "int", v))
    }

    pub fn get_float<F: FieldRef>(&self, field: F) -> Result<f64> {
        let v = self.get(&field)?;
        v.as_float().ok_or_else(|| mismatch(&field, "float", v))
    }

    pub fn get_bool<F: FieldRef>(&self, field: F) -> Result<bool> {
        let v = self.get(&field)?;
        v.as_bool().ok_or_else(|| mismatch(&field, "bool", v))
    }

    /// Valores en las posiciones dadas (clave de agrupación).
    pub(crate) fn project_values(&self, positions: &[usize]) -> Vec<Value> {
        positions.iter().map(|&p| self.values[p].clone()).collect()
    }

    /// Nueva tupla con los campos pedidos, en ese orden.
    pub fn project<S: AsRef<str>>(&self, fields: &[S]) -> Result<Tuple> {
        let positions = self.schema.positions(fields)?;
        let schema = Schema::shared(fields.iter().map(|f| f.as_ref().to_string()))?;
        Ok(Self::from_parts(schema, self.project_values(&positions)))
    }

    /// Objeto JSON `{campo: valor}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = Map::new();
        for (name, v) in self.schema.fields().iter().zip(self.values.iter()) {
            obj.insert(name.clone(), v.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

impl<F: FieldRef + ?Sized> FieldRef for &F {
    fn resolve(&self, schema: &Schema, len: usize) -> Result<usize> {
        (**self).resolve(schema, len)
    }
}

fn mismatch(field: &dyn fmt::Display, expected: &'static str, found: &Value) -> PipelineError {
    PipelineError::TypeMismatch {
        field: field.to_string(),
        expected,
        found: found.type_name(),
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.schema.fields() == other.schema.fields() && self.values == other.values
    }
}

impl Eq for Tuple {}

/// `(word_count=2, line=Apple tree)`
impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (name, v)) in self
            .schema
            .fields()
            .iter()
            .zip(self.values.iter())
            .enumerate()
        {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={v}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (name, v) in self.schema.fields().iter().zip(self.values.iter()) {
            m.entry(name, v);
        }
        m.finish()
    }
}
